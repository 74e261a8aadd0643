/**
 * AGRÉGATION DES STATS - Construction des vues du tableau de bord
 *
 * RÔLE :
 * Interroge toutes les instances du pool puis remet en forme les stats
 * brutes pour la couche de présentation (JSON).
 *
 * FONCTIONNEMENT :
 * - `tube_set`, `worker_summary`, `chart_data` : fonctions pures sur des données déjà lues
 * - `list_all_tube_names`, `collect_tube_stats` : lectures réseau via le pool
 * - Un tube introuvable au moment de lire ses stats est simplement omis
 * - Rien n'est mis en cache : chaque requête recalcule tout
 */

use crate::error::Result;
use crate::models::{
    stat_u64, ChartData, ChartDatum, ChartSeries, DashboardView, JobView, PeekKind, Stats,
    TubePeeks, TubesByConnection, TubesSummary, WorkerSummary,
};
use crate::pool::Pool;
use std::collections::{BTreeMap, BTreeSet};

/// Union des tubes déclarés par chaque connexion
pub fn tube_set(tubes: &TubesByConnection) -> BTreeSet<String> {
    tubes.values().flatten().cloned().collect()
}

pub async fn list_all_tube_names(pool: &Pool) -> Result<BTreeSet<String>> {
    Ok(tube_set(&pool.list_tubes().await?))
}

/// Stats de chaque tube connu, les tubes introuvables sont omis
pub async fn collect_tube_stats(pool: &Pool) -> Result<BTreeMap<String, Stats>> {
    let names = list_all_tube_names(pool).await?;
    stats_for_tubes(pool, &names).await
}

async fn stats_for_tubes(pool: &Pool, names: &BTreeSet<String>) -> Result<BTreeMap<String, Stats>> {
    let mut tubes = BTreeMap::new();
    for name in names {
        match pool.stats_tube(name).await? {
            Some(stats) => {
                tubes.insert(name.clone(), stats);
            }
            None => tracing::debug!("[view] skipping tube {}: not found on any connection", name),
        }
    }
    Ok(tubes)
}

/// `active` = somme des jobs réservés par tube, `total` = workers déclarés par le démon
pub fn worker_summary(tube_stats: &BTreeMap<String, Stats>, global: &Stats) -> WorkerSummary {
    WorkerSummary {
        active: tube_stats
            .values()
            .map(|stats| stat_u64(stats, "current-jobs-reserved"))
            .sum(),
        total: stat_u64(global, "current-workers"),
    }
}

/// Séries pour les graphiques ; les tubes à zéro n'y figurent pas
pub fn chart_data(tube_stats: &BTreeMap<String, Stats>) -> ChartData {
    ChartData {
        total_jobs_data: series(tube_stats, "total-jobs"),
        buried_jobs_data: series(tube_stats, "current-jobs-buried"),
    }
}

fn series(tube_stats: &BTreeMap<String, Stats>, key: &str) -> ChartSeries {
    let items = tube_stats
        .iter()
        .filter_map(|(tube, stats)| {
            let data = stat_u64(stats, key);
            (data > 0).then(|| ChartDatum {
                label: tube.clone(),
                data,
            })
        })
        .collect();
    ChartSeries { items }
}

/// Vue `/api/tubes` : stats par tube, stats globales et résumé des workers
pub async fn tubes_summary(pool: &Pool) -> Result<TubesSummary> {
    let tubes = collect_tube_stats(pool).await?;
    let stats = pool.stats().await?;
    let workers = worker_summary(&tubes, &stats);
    Ok(TubesSummary { tubes, stats, workers })
}

/// Vue principale : tubes par instance, stats globales, graphiques
pub async fn dashboard(pool: &Pool) -> Result<DashboardView> {
    let tubes = pool.list_tubes().await?;
    let stats = pool.stats().await?;
    let names = tube_set(&tubes);
    let charts = chart_data(&stats_for_tubes(pool, &names).await?);

    Ok(DashboardView {
        tubes,
        stats,
        tube_set: names.into_iter().collect(),
        total_jobs_data: charts.total_jobs_data,
        buried_jobs_data: Some(charts.buried_jobs_data).filter(|s| !s.items.is_empty()),
    })
}

/// Prochain job d'un tube (None si aucune instance n'en a)
pub async fn peek_tube(pool: &Pool, tube: &str, kind: PeekKind) -> Result<Option<JobView>> {
    let job = pool
        .on_tube(tube, |conn| async move { conn.peek(tube, kind).await })
        .await?;
    Ok(job.map(JobView::from))
}

/// Vue `/peeks` : prochain job ready et delayed de chaque tube
pub async fn peek_all(pool: &Pool) -> Result<BTreeMap<String, TubePeeks>> {
    let mut peeks = BTreeMap::new();
    for tube in list_all_tube_names(pool).await? {
        let ready = peek_tube(pool, &tube, PeekKind::Ready).await?;
        let delayed = peek_tube(pool, &tube, PeekKind::Delayed).await?;
        peeks.insert(tube, TubePeeks { ready, delayed });
    }
    Ok(peeks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Connection;
    use crate::pool::tests::ScriptedConnection;
    use serde_json::json;
    use std::sync::Arc;

    fn tube(pairs: &[(&str, u64)]) -> Stats {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    #[test]
    fn test_tube_set_collapses_duplicates() {
        let mut tubes = TubesByConnection::new();
        tubes.insert("a:11300".into(), vec!["default".into()]);
        tubes.insert("b:11300".into(), vec!["default".into(), "urgent".into()]);

        let set = tube_set(&tubes);
        assert_eq!(set.len(), 2);
        assert!(set.contains("default"));
        assert!(set.contains("urgent"));
    }

    #[test]
    fn test_worker_summary_sums_reserved_jobs() {
        let mut tubes = BTreeMap::new();
        tubes.insert("a".to_string(), tube(&[("current-jobs-reserved", 2)]));
        tubes.insert("b".to_string(), tube(&[("current-jobs-reserved", 0)]));
        tubes.insert("c".to_string(), tube(&[("current-jobs-reserved", 3)]));
        tubes.insert("d".to_string(), Stats::new());

        let global = tube(&[("current-workers", 9)]);
        assert_eq!(worker_summary(&tubes, &global), WorkerSummary { active: 5, total: 9 });
        assert_eq!(worker_summary(&tubes, &Stats::new()).active, 5);
    }

    #[test]
    fn test_worker_summary_ignores_non_numeric_values() {
        let mut tubes = BTreeMap::new();
        let mut odd = Stats::new();
        odd.insert("current-jobs-reserved".into(), json!("n/a"));
        tubes.insert("odd".to_string(), odd);
        tubes.insert("ok".to_string(), tube(&[("current-jobs-reserved", 4)]));

        assert_eq!(worker_summary(&tubes, &Stats::new()).active, 4);
    }

    #[test]
    fn test_chart_data_skips_zero_values() {
        let mut tubes = BTreeMap::new();
        tubes.insert("idle".to_string(), tube(&[("total-jobs", 0), ("current-jobs-buried", 0)]));
        tubes.insert("busy".to_string(), tube(&[("total-jobs", 5), ("current-jobs-buried", 2)]));
        tubes.insert("clean".to_string(), tube(&[("total-jobs", 1), ("current-jobs-buried", 0)]));

        let charts = chart_data(&tubes);
        assert_eq!(
            charts.total_jobs_data.items,
            vec![
                ChartDatum { label: "busy".into(), data: 5 },
                ChartDatum { label: "clean".into(), data: 1 },
            ]
        );
        assert_eq!(
            charts.buried_jobs_data.items,
            vec![ChartDatum { label: "busy".into(), data: 2 }]
        );
        assert!(!charts.total_jobs_data.items.iter().any(|d| d.label == "idle"));
    }

    #[test]
    fn test_chart_data_serialized_shape() {
        let mut tubes = BTreeMap::new();
        tubes.insert("default".to_string(), tube(&[("total-jobs", 5)]));

        let value = serde_json::to_value(chart_data(&tubes)).unwrap();
        assert_eq!(value["total_jobs_data"]["items"][0]["label"], "default");
        assert_eq!(value["total_jobs_data"]["items"][0]["data"], 5);
        assert_eq!(value["buried_jobs_data"]["items"], json!([]));
    }

    #[tokio::test]
    async fn test_list_all_tube_names_unions_connections() {
        let pool = Pool::new(vec![
            Arc::new(ScriptedConnection::new("a:1", &["default"])) as Arc<dyn Connection>,
            Arc::new(ScriptedConnection::new("b:2", &["default", "urgent"])),
        ]);

        let names = list_all_tube_names(&pool).await.unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["default", "urgent"]);
    }

    #[tokio::test]
    async fn test_tubes_summary_single_instance() {
        let pool = Pool::new(vec![Arc::new(
            ScriptedConnection::new("a:1", &["default", "urgent"])
                .with_tube_stats(tube(&[("current-jobs-reserved", 2), ("total-jobs", 4)]))
                .with_stats(tube(&[("current-workers", 6)])),
        ) as Arc<dyn Connection>]);

        let summary = tubes_summary(&pool).await.unwrap();
        assert_eq!(summary.tubes.len(), 2);
        assert_eq!(summary.tubes["urgent"]["name"], "urgent");
        assert_eq!(summary.workers, WorkerSummary { active: 4, total: 6 });
    }

    #[tokio::test]
    async fn test_peek_all_reports_empty_tubes() {
        let pool = Pool::new(vec![
            Arc::new(ScriptedConnection::new("a:1", &["default"])) as Arc<dyn Connection>,
        ]);

        let peeks = peek_all(&pool).await.unwrap();
        assert!(peeks["default"].ready.is_none());
        assert!(peeks["default"].delayed.is_none());
    }
}

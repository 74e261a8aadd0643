use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistiques brutes renvoyées par beanstalkd (`stats`, `stats-tube`, `stats-job`)
/// Clé = nom de la stat ("current-jobs-ready", "total-jobs"...), valeur = nombre ou texte
pub type Stats = BTreeMap<String, serde_json::Value>;

/// Noms de tubes par connexion (adresse "host:port" -> tubes connus de cette instance)
pub type TubesByConnection = BTreeMap<String, Vec<String>>;

/// Lit une stat comme entier ; absente ou non numérique => 0
pub fn stat_u64(stats: &Stats, key: &str) -> u64 {
    match stats.get(key) {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f > 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(serde_json::Value::String(s)) => leading_digits(s),
        _ => 0,
    }
}

pub fn leading_digits(s: &str) -> u64 {
    let digits: String = s.trim_start().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeekKind {
    Ready,
    Delayed,
    Buried,
}

impl PeekKind {
    /// "ready" et "delayed" sont reconnus, tout le reste vise les jobs buried
    pub fn from_param(param: &str) -> Self {
        match param {
            "ready" => Self::Ready,
            "delayed" => Self::Delayed,
            _ => Self::Buried,
        }
    }

    pub fn command(&self) -> &'static str {
        match self {
            Self::Ready => "peek-ready",
            Self::Delayed => "peek-delayed",
            Self::Buried => "peek-buried",
        }
    }
}

/// Job obtenu par un peek, accompagné de son `stats-job`
#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub body: Vec<u8>,
    pub stats: Stats,
}

/// Vue JSON d'un job : ses stats à plat plus le champ "body"
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    #[serde(flatten)]
    pub stats: Stats,
    pub body: String,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            stats: job.stats,
            body: String::from_utf8_lossy(&job.body).into_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartDatum {
    pub label: String,
    pub data: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChartSeries {
    pub items: Vec<ChartDatum>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChartData {
    pub total_jobs_data: ChartSeries,
    pub buried_jobs_data: ChartSeries,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSummary {
    pub active: u64,
    pub total: u64,
}

/// Réponse de `/api/tubes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TubesSummary {
    pub tubes: BTreeMap<String, Stats>,
    pub stats: Stats,
    pub workers: WorkerSummary,
}

/// Prochains jobs ready/delayed d'un tube (vue `/peeks`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TubePeeks {
    pub ready: Option<JobView>,
    pub delayed: Option<JobView>,
}

/// Vue principale du tableau de bord
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardView {
    pub tubes: TubesByConnection,
    pub stats: Stats,
    pub tube_set: Vec<String>,
    pub total_jobs_data: ChartSeries,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buried_jobs_data: Option<ChartSeries>,
}

/**
 * POOL DE CONNEXIONS - Routage des actions vers l'instance qui connaît le tube
 *
 * RÔLE :
 * Détient les connexions vivantes vers les instances beanstalkd et choisit
 * sur laquelle exécuter une action ciblant un tube donné.
 *
 * FONCTIONNEMENT :
 * - Aucune table tube -> instance : chaque instance a ses propres tubes
 * - `on_tube` tire une connexion au hasard, au plus 2 x (connexions vivantes) fois,
 *   et s'arrête au premier résultat obtenu
 * - NOT_FOUND sur une instance = "pas ici", on retente ailleurs
 * - Réponse inattendue = erreur remontée immédiatement, sans nouvel essai
 * - Erreur de transport = connexion retirée définitivement du pool, erreur remontée
 *
 * LIMITE CONNUE :
 * Si le tube n'existe que sur une instance parmi N, 2N tirages aléatoires peuvent
 * (rarement) tous la manquer. Avec une seule instance, le premier essai suffit toujours.
 */

use crate::client::{ClientOptions, Connection, TcpConnection};
use crate::error::{BeanstalkError, Result};
use crate::models::{Stats, TubesByConnection};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stats globales qui décrivent une instance et ne s'additionnent pas
const IDENTITY_STATS: &[&str] = &[
    "pid", "version", "id", "hostname", "os", "platform", "uptime", "max-job-size",
];

pub struct Pool {
    connections: Mutex<Vec<Arc<dyn Connection>>>,
    configured: usize,
    evictions: AtomicU64,
}

impl Pool {
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Self {
        let configured = connections.len();
        Self {
            connections: Mutex::new(connections),
            configured,
            evictions: AtomicU64::new(0),
        }
    }

    /// Ouvre une connexion vers chaque adresse ; celles qui échouent sont ignorées
    pub async fn connect(addresses: &[String], options: ClientOptions) -> Self {
        let mut connections: Vec<Arc<dyn Connection>> = Vec::with_capacity(addresses.len());
        for address in addresses {
            match TcpConnection::connect(address, options).await {
                Ok(conn) => {
                    tracing::info!("[pool] connected to beanstalkd at {}", address);
                    connections.push(Arc::new(conn));
                }
                Err(e) => tracing::warn!("[pool] failed to connect to {}: {}", address, e),
            }
        }

        Self {
            configured: addresses.len(),
            ..Self::new(connections)
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Nombre d'adresses demandées au démarrage
    pub fn configured(&self) -> usize {
        self.configured
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.connections
            .lock()
            .iter()
            .map(|c| c.address().to_string())
            .collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.lock().clone()
    }

    fn pick(&self) -> Option<Arc<dyn Connection>> {
        self.connections.lock().choose(&mut rand::thread_rng()).cloned()
    }

    /// Retire une connexion du pool (comparaison par identité, pas par adresse)
    pub fn evict(&self, conn: &Arc<dyn Connection>) -> bool {
        let target = Arc::as_ptr(conn).cast::<()>();
        let mut connections = self.connections.lock();
        let before = connections.len();
        connections.retain(|c| Arc::as_ptr(c).cast::<()>() != target);
        let removed = connections.len() < before;
        drop(connections);

        if removed {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("[pool] evicted connection to {} after transport failure", conn.address());
        }
        removed
    }

    /// Applique la règle d'éviction : une erreur de transport retire la connexion
    fn settle<T>(&self, conn: &Arc<dyn Connection>, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                self.evict(conn);
            }
        }
        result
    }

    /// Exécute `action` sur une connexion qui connaît `tube`
    ///
    /// Renvoie `Ok(None)` si aucun des 2 x N essais n'a abouti.
    pub async fn on_tube<T, F, Fut>(&self, tube: &str, mut action: F) -> Result<Option<T>>
    where
        F: FnMut(Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tries = self.len() * 2;
        if tries == 0 {
            return Err(BeanstalkError::NotConnected);
        }

        for attempt in 1..=tries {
            let conn = self.pick().ok_or(BeanstalkError::NotConnected)?;
            let result = action(Arc::clone(&conn)).await;
            match self.settle(&conn, result) {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(
                        "[pool] tube {} not found on {} (try {}/{})",
                        tube,
                        conn.address(),
                        attempt,
                        tries
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Tubes connus de chaque instance, indexés par adresse
    pub async fn list_tubes(&self) -> Result<TubesByConnection> {
        let connections = self.snapshot();
        if connections.is_empty() {
            return Err(BeanstalkError::NotConnected);
        }

        let mut by_connection = TubesByConnection::new();
        for conn in &connections {
            let tubes = self.settle(conn, conn.list_tubes().await)?;
            by_connection.insert(conn.address().to_string(), tubes);
        }
        Ok(by_connection)
    }

    /// Stats du démon, fusionnées sur toutes les instances
    pub async fn stats(&self) -> Result<Stats> {
        let connections = self.snapshot();
        if connections.is_empty() {
            return Err(BeanstalkError::NotConnected);
        }

        let mut merged = Stats::new();
        for conn in &connections {
            let stats = self.settle(conn, conn.stats().await)?;
            merge_stats(&mut merged, stats);
        }
        Ok(merged)
    }

    pub async fn stats_tube(&self, tube: &str) -> Result<Option<Stats>> {
        self.on_tube(tube, |conn| async move { conn.stats_tube(tube).await })
            .await
    }
}

/// Additionne les compteurs numériques ; le reste garde la première valeur vue
pub fn merge_stats(into: &mut Stats, stats: Stats) {
    for (key, value) in stats {
        match into.get_mut(&key) {
            Some(existing) => {
                if IDENTITY_STATS.contains(&key.as_str()) {
                    continue;
                }
                if let Some(sum) = add_numbers(existing, &value) {
                    *existing = sum;
                }
            }
            None => {
                into.insert(key, value);
            }
        }
    }
}

fn add_numbers(a: &Value, b: &Value) -> Option<Value> {
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return None;
    };
    if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
        return Some(Value::from(x.saturating_add(y)));
    }
    let sum = x.as_f64()? + y.as_f64()?;
    serde_json::Number::from_f64(sum).map(Value::Number)
}

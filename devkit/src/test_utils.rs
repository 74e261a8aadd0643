/*!
Test Harness pour beanstalkd-view

Facilite l'écriture de tests d'intégration avec:
- Démarrage de N faux démons beanstalkd
- Accès aux adresses à passer au pool
- Assertions sur les commandes reçues par chaque démon
*/

use crate::daemon_stub::StubDaemon;
use anyhow::Result;

/// Harness de test : un ensemble de démons simulés
pub struct TestHarness {
    daemons: Vec<StubDaemon>,
}

impl TestHarness {
    /// Démarre `count` démons, chacun avec le tube "default"
    pub async fn start(count: usize) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let mut daemons = Vec::with_capacity(count);
        for _ in 0..count {
            daemons.push(StubDaemon::start().await?);
        }
        log::info!("🧪 Started {} stub daemons", count);
        Ok(Self { daemons })
    }

    pub fn addresses(&self) -> Vec<String> {
        self.daemons.iter().map(StubDaemon::address).collect()
    }

    pub fn daemon(&self, index: usize) -> &StubDaemon {
        &self.daemons[index]
    }

    pub fn len(&self) -> usize {
        self.daemons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.daemons.is_empty()
    }

    /// Nombre de commandes dont le premier mot est `verb`, tous démons confondus
    pub fn count_commands(&self, verb: &str) -> usize {
        self.daemons
            .iter()
            .flat_map(|d| d.commands())
            .filter(|line| line.split_whitespace().next() == Some(verb))
            .count()
    }

    /// Assert qu'un démon a reçu exactement cette commande
    pub fn assert_command_sent(&self, index: usize, command: &str) -> Result<()> {
        if self.daemon(index).commands().iter().any(|c| c == command) {
            log::info!("✅ Daemon {} received '{}'", index, command);
            return Ok(());
        }
        anyhow::bail!("Daemon {} never received '{}'", index, command);
    }

    /// Reset le journal de commandes de tous les démons
    pub fn clear_commands(&self) {
        for daemon in &self.daemons {
            daemon.clear_commands();
        }
        log::info!("🧹 Command logs cleared");
    }
}

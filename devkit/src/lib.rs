/*!
# beanstalkd-view DevKit - Faux démons et utilitaires de test

Bibliothèque facilitant les tests du tableau de bord avec:
- Démon beanstalkd simulé en mémoire (TCP réel, port éphémère)
- Injection de pannes (coupure, réponse hors protocole)
- Harness multi-instances avec assertions sur les commandes
*/

pub mod daemon_stub;
pub mod test_utils;

pub use daemon_stub::{Fault, JobState, StubDaemon};
pub use test_utils::TestHarness;

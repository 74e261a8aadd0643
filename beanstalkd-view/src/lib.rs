/*!
# beanstalkd-view - Tableau de bord web pour beanstalkd

Surveille et pilote une ou plusieurs instances beanstalkd :
- Pool de connexions avec routage "premier qui répond" (`Pool::on_tube`)
- Agrégation des stats globales et par tube
- API HTTP JSON (vues + actions opérateur)
*/

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod models;
pub mod pool;
pub mod state;
pub mod stats;

pub use client::{Connection, TcpConnection};
pub use error::{BeanstalkError, Result};
pub use pool::Pool;
pub use state::AppState;

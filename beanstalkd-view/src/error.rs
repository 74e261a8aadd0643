use std::io;

/// Erreurs possibles lors d'un échange avec une instance beanstalkd
///
/// Quatre familles, traitées différemment par le routeur du pool :
/// - `NotFound` : le tube/job n'existe pas sur CETTE instance (attendu, on réessaie ailleurs)
/// - `UnexpectedResponse` : réponse incompréhensible (décalage de version client/démon)
/// - `Transport` : connexion perdue, la connexion fautive est retirée du pool
/// - `NotConnected` : plus aucune connexion vivante
///
/// `InvalidTubeName` est levée avant toute écriture sur la socket.
#[derive(Debug, thiserror::Error)]
pub enum BeanstalkError {
    #[error("not found")]
    NotFound,
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error("not connected to any beanstalkd instance")]
    NotConnected,
    #[error("invalid tube name: {0:?}")]
    InvalidTubeName(String),
}

impl BeanstalkError {
    pub fn unexpected(what: impl Into<String>) -> Self {
        Self::UnexpectedResponse(what.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_yaml::Error> for BeanstalkError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::UnexpectedResponse(format!("invalid YAML payload: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, BeanstalkError>;

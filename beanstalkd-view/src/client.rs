/**
 * CLIENT BEANSTALKD - Connexion à une instance du démon de files de jobs
 *
 * RÔLE :
 * Parle le protocole texte de beanstalkd sur TCP pour le compte du tableau de bord.
 * Le trait `Connection` est la seule surface utilisée par le pool et l'agrégateur,
 * ce qui permet de les tester avec des connexions simulées.
 *
 * PROTOCOLE :
 * - Requête = une ligne terminée par \r\n (+ corps pour `put`)
 * - Réponse = ligne de statut, éventuellement suivie de <n> octets + \r\n
 * - `list-tubes`, `stats`, `stats-tube`, `stats-job` renvoient du YAML
 * - `peek-*`, `put` et `kick` agissent sur le tube sélectionné par `use`
 *
 * CLASSEMENT DES ERREURS :
 * - NOT_FOUND                -> BeanstalkError::NotFound
 * - tout autre statut inconnu -> BeanstalkError::UnexpectedResponse
 * - erreur d'E/S, fin de flux -> BeanstalkError::Transport
 * - nom de tube hors grammaire -> BeanstalkError::InvalidTubeName (rien n'est envoyé)
 *
 * DÉSYNCHRONISATION :
 * Une connexion est marquée désynchronisée dès qu'une commande part, et ne
 * redevient saine qu'une fois la réponse complète lue. Requête annulée en
 * cours de route, longueur illisible, corps trop grand ou mal terminé :
 * la marque reste, et l'appel suivant échoue en Transport (donc éviction).
 */

use crate::error::{BeanstalkError, Result};
use crate::models::{Job, PeekKind, Stats};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::io;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Opérations du protocole utilisées par le tableau de bord
///
/// Chaque méthode est atomique vis-à-vis de la connexion : le `use <tube>`
/// éventuel et la commande sont envoyés sans qu'une autre requête s'intercale.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Adresse "host:port" de l'instance, sert d'identifiant dans le pool
    fn address(&self) -> &str;

    async fn list_tubes(&self) -> Result<Vec<String>>;

    async fn stats(&self) -> Result<Stats>;

    async fn stats_tube(&self, tube: &str) -> Result<Stats>;

    /// Insère un job dans `tube`, renvoie son id
    async fn put(&self, tube: &str, body: &[u8], priority: u32, delay: u32, ttr: u32) -> Result<u64>;

    /// Prochain job ready/delayed/buried de `tube` avec ses stats
    async fn peek(&self, tube: &str, kind: PeekKind) -> Result<Job>;

    async fn delete(&self, job_id: u64) -> Result<()>;

    async fn pause_tube(&self, tube: &str, delay: u32) -> Result<()>;

    /// Remet jusqu'à `bound` jobs buried (ou delayed) en ready, renvoie le nombre déplacé
    async fn kick(&self, tube: &str, bound: u32) -> Result<u64>;
}

/// Taille maximale d'un nom de tube accepté par beanstalkd
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Plafond par défaut d'un bloc de données (`OK <n>`, `FOUND <id> <n>`)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Grammaire beanstalkd : lettres, chiffres et `-+/;.$_()`, 1 à 200 octets,
/// pas de `-` en tête
pub fn is_valid_tube_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TUBE_NAME_LEN
        && !name.starts_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-+/;.$_()".contains(&b))
}

fn check_tube(tube: &str) -> Result<()> {
    if is_valid_tube_name(tube) {
        Ok(())
    } else {
        Err(BeanstalkError::InvalidTubeName(tube.to_string()))
    }
}

/// Réglages d'ouverture d'une connexion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    pub connect_timeout: Option<Duration>,
    pub max_payload: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Connexion TCP réelle vers un beanstalkd
pub struct TcpConnection {
    address: String,
    wire: Mutex<Wire>,
}

struct Wire {
    stream: BufStream<TcpStream>,
    // tube courant côté serveur ; beanstalkd démarre sur "default"
    using: String,
    // vrai entre l'envoi d'une commande et la lecture complète de sa réponse
    desynced: bool,
    max_payload: usize,
}

impl TcpConnection {
    pub async fn connect(address: &str, options: ClientOptions) -> Result<Self> {
        let stream = match options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, TcpStream::connect(address))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??,
            None => TcpStream::connect(address).await?,
        };
        stream.set_nodelay(true)?;
        tracing::debug!("[client] connected to {}", address);

        Ok(Self {
            address: address.to_string(),
            wire: Mutex::new(Wire {
                stream: BufStream::new(stream),
                using: "default".to_string(),
                desynced: false,
                max_payload: options.max_payload,
            }),
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn list_tubes(&self) -> Result<Vec<String>> {
        let mut wire = self.wire.lock().await;
        let payload = wire.request_payload("list-tubes").await?;
        decode_yaml(&payload)
    }

    async fn stats(&self) -> Result<Stats> {
        let mut wire = self.wire.lock().await;
        let payload = wire.request_payload("stats").await?;
        decode_yaml(&payload)
    }

    async fn stats_tube(&self, tube: &str) -> Result<Stats> {
        check_tube(tube)?;
        let mut wire = self.wire.lock().await;
        let payload = wire.request_payload(&format!("stats-tube {tube}")).await?;
        decode_yaml(&payload)
    }

    async fn put(&self, tube: &str, body: &[u8], priority: u32, delay: u32, ttr: u32) -> Result<u64> {
        let mut wire = self.wire.lock().await;
        wire.use_tube(tube).await?;
        let command = format!("put {priority} {delay} {ttr} {}", body.len());
        let line = wire.send(&command, Some(body)).await?;
        let (word, args) = split_status(&line);
        match (word, args.as_slice()) {
            ("INSERTED", [id]) | ("BURIED", [id]) => parse_number(id, &line),
            _ => Err(status_error(&line)),
        }
    }

    async fn peek(&self, tube: &str, kind: PeekKind) -> Result<Job> {
        let mut wire = self.wire.lock().await;
        wire.use_tube(tube).await?;
        let line = wire.send(kind.command(), None).await?;
        let (word, args) = split_status(&line);
        let (id, len) = match (word, args.as_slice()) {
            ("FOUND", [id, len]) => (parse_number::<u64>(id, &line)?, parse_number::<usize>(len, &line)?),
            _ => return Err(status_error(&line)),
        };
        let body = wire.read_body(len).await?;
        // job supprimé entre FOUND et stats-job : trouvé quand même, stats réduites à l'id
        let stats = match wire.request_payload(&format!("stats-job {id}")).await {
            Ok(payload) => decode_yaml(&payload)?,
            Err(BeanstalkError::NotFound) => Stats::from([("id".to_string(), id.into())]),
            Err(e) => return Err(e),
        };
        Ok(Job { id, body, stats })
    }

    async fn delete(&self, job_id: u64) -> Result<()> {
        let mut wire = self.wire.lock().await;
        let line = wire.send(&format!("delete {job_id}"), None).await?;
        expect_status(&line, "DELETED")
    }

    async fn pause_tube(&self, tube: &str, delay: u32) -> Result<()> {
        check_tube(tube)?;
        let mut wire = self.wire.lock().await;
        let line = wire.send(&format!("pause-tube {tube} {delay}"), None).await?;
        expect_status(&line, "PAUSED")
    }

    async fn kick(&self, tube: &str, bound: u32) -> Result<u64> {
        let mut wire = self.wire.lock().await;
        wire.use_tube(tube).await?;
        let line = wire.send(&format!("kick {bound}"), None).await?;
        let (word, args) = split_status(&line);
        match (word, args.as_slice()) {
            ("KICKED", [count]) => parse_number(count, &line),
            _ => Err(status_error(&line)),
        }
    }
}

impl Wire {
    /// Envoie une commande (et son corps) puis lit la ligne de statut
    async fn send(&mut self, command: &str, body: Option<&[u8]>) -> Result<String> {
        if self.desynced {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection out of protocol sync").into());
        }
        self.desynced = true;
        tracing::trace!("[client] >> {}", command);
        self.stream.write_all(command.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        if let Some(body) = body {
            self.stream.write_all(body).await?;
            self.stream.write_all(b"\r\n").await?;
        }
        self.stream.flush().await?;
        let line = self.read_line().await?;
        // seuls OK et FOUND annoncent un bloc de données à suivre
        if !matches!(split_status(&line).0, "OK" | "FOUND") {
            self.desynced = false;
        }
        Ok(line)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = self.stream.read_line(&mut line).await?;
        if read == 0 || !line.ends_with('\n') {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by server").into());
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();
        tracing::trace!("[client] << {}", line);
        Ok(line)
    }

    async fn read_body(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > self.max_payload {
            return Err(BeanstalkError::unexpected(format!(
                "payload of {len} bytes exceeds limit of {}",
                self.max_payload
            )));
        }
        let mut buf = vec![0u8; len + 2];
        self.stream.read_exact(&mut buf).await?;
        if &buf[len..] != b"\r\n" {
            return Err(BeanstalkError::unexpected("payload not terminated by CRLF"));
        }
        buf.truncate(len);
        self.desynced = false;
        Ok(buf)
    }

    /// Commande dont la réponse attendue est `OK <n>` + données
    async fn request_payload(&mut self, command: &str) -> Result<Vec<u8>> {
        let line = self.send(command, None).await?;
        let (word, args) = split_status(&line);
        match (word, args.as_slice()) {
            ("OK", [len]) => {
                let len = parse_number(len, &line)?;
                self.read_body(len).await
            }
            _ => Err(status_error(&line)),
        }
    }

    async fn use_tube(&mut self, tube: &str) -> Result<()> {
        check_tube(tube)?;
        if self.using == tube {
            return Ok(());
        }
        let line = self.send(&format!("use {tube}"), None).await?;
        let (word, args) = split_status(&line);
        match (word, args.as_slice()) {
            ("USING", [name]) if *name == tube => {
                self.using = tube.to_string();
                Ok(())
            }
            _ => Err(status_error(&line)),
        }
    }
}

/// Découpe une ligne de statut : "FOUND 12 5" -> ("FOUND", ["12", "5"])
fn split_status(line: &str) -> (&str, Vec<&str>) {
    let mut parts = line.split_whitespace();
    let word = parts.next().unwrap_or("");
    (word, parts.collect())
}

fn status_error(line: &str) -> BeanstalkError {
    if line == "NOT_FOUND" {
        BeanstalkError::NotFound
    } else {
        BeanstalkError::unexpected(line)
    }
}

fn expect_status(line: &str, expected: &str) -> Result<()> {
    if line == expected {
        Ok(())
    } else {
        Err(status_error(line))
    }
}

fn parse_number<T: FromStr>(raw: &str, line: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| BeanstalkError::unexpected(format!("bad number in {line:?}")))
}

fn decode_yaml<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_yaml::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Serveur scripté : pour chaque ligne reçue, renvoie la réponse brute suivante.
    /// Les corps de `put` sont consommés avec leur ligne de commande.
    async fn scripted_server(replies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                if line.starts_with("put ") {
                    let mut body = String::new();
                    reader.read_line(&mut body).await.unwrap();
                }
                received.push(line);
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });
        (address, handle)
    }

    #[test]
    fn test_split_status() {
        assert_eq!(split_status("FOUND 12 5"), ("FOUND", vec!["12", "5"]));
        assert_eq!(split_status("DELETED"), ("DELETED", vec![]));
        assert_eq!(split_status(""), ("", vec![]));
    }

    #[test]
    fn test_status_error_classification() {
        assert!(status_error("NOT_FOUND").is_not_found());
        assert!(matches!(status_error("OUT_OF_MEMORY"), BeanstalkError::UnexpectedResponse(_)));
        assert!(matches!(status_error("DRAINING"), BeanstalkError::UnexpectedResponse(_)));
        assert!(expect_status("PAUSED", "PAUSED").is_ok());
        assert!(expect_status("NOT_FOUND", "PAUSED").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_tubes_and_stats_tube() {
        let (address, server) = scripted_server(vec![
            "OK 23\r\n---\n- default\n- urgent\n\r\n",
            "OK 40\r\n---\nname: urgent\ntotal-jobs: 5\npause: 0\n\r\n",
        ])
        .await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        let tubes = conn.list_tubes().await.unwrap();
        assert_eq!(tubes, vec!["default", "urgent"]);

        let stats = conn.stats_tube("urgent").await.unwrap();
        assert_eq!(stats["name"], "urgent");
        assert_eq!(stats["total-jobs"], 5);

        assert_eq!(server.await.unwrap(), vec!["list-tubes", "stats-tube urgent"]);
    }

    #[tokio::test]
    async fn test_put_uses_tube_once() {
        let (address, server) = scripted_server(vec![
            "USING urgent\r\n",
            "INSERTED 7\r\n",
            "BURIED 8\r\n",
        ])
        .await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        assert_eq!(conn.put("urgent", b"hello", 10, 0, 60).await.unwrap(), 7);
        assert_eq!(conn.put("urgent", b"again", 10, 0, 60).await.unwrap(), 8);

        assert_eq!(
            server.await.unwrap(),
            vec!["use urgent", "put 10 0 60 5", "put 10 0 60 5"]
        );
    }

    #[tokio::test]
    async fn test_peek_fetches_job_stats() {
        let (address, server) = scripted_server(vec![
            "FOUND 3 4\r\nbody\r\n",
            "OK 24\r\n---\nid: 3\ntube: default\n\r\n",
        ])
        .await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        let job = conn.peek("default", PeekKind::Ready).await.unwrap();
        assert_eq!(job.id, 3);
        assert_eq!(job.body, b"body");
        assert_eq!(job.stats["tube"], "default");

        assert_eq!(server.await.unwrap(), vec!["peek-ready", "stats-job 3"]);
    }

    #[tokio::test]
    async fn test_not_found_and_unexpected_responses() {
        let (address, _server) = scripted_server(vec![
            "NOT_FOUND\r\n",
            "UNKNOWN_COMMAND\r\n",
            "KICKED many\r\n",
        ])
        .await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        assert!(conn.delete(42).await.unwrap_err().is_not_found());
        assert!(matches!(
            conn.pause_tube("default", 10).await.unwrap_err(),
            BeanstalkError::UnexpectedResponse(_)
        ));
        assert!(matches!(
            conn.kick("default", 5).await.unwrap_err(),
            BeanstalkError::UnexpectedResponse(_)
        ));
    }

    #[tokio::test]
    async fn test_payload_without_crlf_is_unexpected() {
        let (address, _server) = scripted_server(vec!["OK 4\r\nabcdXY"]).await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        let err = conn.stats().await.unwrap_err();
        assert!(matches!(err, BeanstalkError::UnexpectedResponse(_)));
        // lecture décalée : la connexion n'est plus utilisable
        assert!(conn.list_tubes().await.unwrap_err().is_transport());
    }

    #[test]
    fn test_tube_name_grammar() {
        for name in ["default", "jobs/mail_v2", "a+b;c.d$e(f)", "x-1"] {
            assert!(is_valid_tube_name(name), "rejected {name:?}");
        }
        let too_long = "a".repeat(MAX_TUBE_NAME_LEN + 1);
        for name in ["", "-lead", "two words", "crlf\r\nstats", "bad!", "é", too_long.as_str()] {
            assert!(!is_valid_tube_name(name), "accepted {name:?}");
        }
        assert!(is_valid_tube_name(&"a".repeat(MAX_TUBE_NAME_LEN)));
    }

    #[tokio::test]
    async fn test_invalid_tube_name_sends_nothing() {
        let (address, server) = scripted_server(vec![]).await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        let injected = "default\r\ndelete 1";
        assert!(matches!(
            conn.stats_tube(injected).await.unwrap_err(),
            BeanstalkError::InvalidTubeName(_)
        ));
        assert!(matches!(
            conn.pause_tube("two words", 5).await.unwrap_err(),
            BeanstalkError::InvalidTubeName(_)
        ));
        assert!(matches!(
            conn.put(injected, b"x", 0, 0, 60).await.unwrap_err(),
            BeanstalkError::InvalidTubeName(_)
        ));
        assert!(matches!(
            conn.peek("-lead", PeekKind::Ready).await.unwrap_err(),
            BeanstalkError::InvalidTubeName(_)
        ));
        assert!(matches!(
            conn.kick("a\nb", 1).await.unwrap_err(),
            BeanstalkError::InvalidTubeName(_)
        ));

        assert!(server.await.unwrap().is_empty());
    }

    /// Serveur qui répond à la première commande avec du retard, puis attend la fermeture
    async fn slow_server(delay: Duration, reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            tokio::time::sleep(delay).await;
            let _ = write_half.write_all(reply.as_bytes()).await;
            while reader.read_line(&mut line).await.unwrap_or(0) > 0 {}
        });
        address
    }

    #[tokio::test]
    async fn test_cancelled_request_poisons_connection() {
        let address = slow_server(Duration::from_millis(100), "OK 8\r\n---\n- a\n\r\n").await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        let cancelled = tokio::time::timeout(Duration::from_millis(20), conn.list_tubes()).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(conn.stats().await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_cancelled_request_evicts_from_pool() {
        use crate::pool::Pool;
        use std::sync::Arc;

        let address = slow_server(Duration::from_millis(100), "OK 8\r\n---\n- a\n\r\n").await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();
        let pool = Pool::new(vec![Arc::new(conn) as Arc<dyn Connection>]);

        let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.list_tubes()).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.len(), 1);

        assert!(pool.stats().await.unwrap_err().is_transport());
        assert!(pool.is_empty());
        assert_eq!(pool.evictions(), 1);
    }

    #[tokio::test]
    async fn test_malformed_length_poisons_connection() {
        let (address, server) = scripted_server(vec!["OK abc\r\n"]).await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        assert!(matches!(
            conn.stats().await.unwrap_err(),
            BeanstalkError::UnexpectedResponse(_)
        ));
        assert!(conn.list_tubes().await.unwrap_err().is_transport());
        assert_eq!(server.await.unwrap(), vec!["stats"]);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let (address, _server) = scripted_server(vec!["OK 18446744073709551615\r\n"]).await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        assert!(matches!(
            conn.stats().await.unwrap_err(),
            BeanstalkError::UnexpectedResponse(_)
        ));
        assert!(conn.stats().await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_payload_limit_is_configurable() {
        let (address, _server) = scripted_server(vec!["OK 23\r\n---\n- default\n- urgent\n\r\n"]).await;
        let options = ClientOptions {
            max_payload: 16,
            ..ClientOptions::default()
        };
        let conn = TcpConnection::connect(&address, options).await.unwrap();

        assert!(matches!(
            conn.list_tubes().await.unwrap_err(),
            BeanstalkError::UnexpectedResponse(_)
        ));
    }

    #[tokio::test]
    async fn test_peek_keeps_job_deleted_before_stats() {
        let (address, server) = scripted_server(vec![
            "FOUND 3 4\r\nbody\r\n",
            "NOT_FOUND\r\n",
            "OK 14\r\n---\n- default\n\r\n",
        ])
        .await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        let job = conn.peek("default", PeekKind::Ready).await.unwrap();
        assert_eq!(job.id, 3);
        assert_eq!(job.body, b"body");
        assert_eq!(job.stats["id"], 3);

        // la connexion reste synchronisée
        assert_eq!(conn.list_tubes().await.unwrap(), vec!["default"]);
        assert_eq!(server.await.unwrap(), vec!["peek-ready", "stats-job 3", "list-tubes"]);
    }

    #[tokio::test]
    async fn test_closed_socket_is_transport_failure() {
        let (address, _server) = scripted_server(vec![]).await;
        let conn = TcpConnection::connect(&address, ClientOptions::default()).await.unwrap();

        let err = conn.list_tubes().await.unwrap_err();
        assert!(err.is_transport());
    }
}

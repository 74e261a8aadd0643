/*!
Faux démon beanstalkd pour tests sans serveur réel

Écoute sur 127.0.0.1 (port éphémère) et répond au sous-ensemble du protocole
texte utilisé par le tableau de bord. L'état (tubes, jobs, workers) est en
mémoire, modifiable depuis le test, et chaque commande reçue est journalisée.
*/

use anyhow::Result;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Panne injectée, consommée par la prochaine commande reçue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Ferme la socket sans répondre
    Disconnect,
    /// Répond une ligne hors protocole
    Garbage,
    /// Répond normalement, mais après ce délai
    Slow(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Delayed,
    Buried,
}

impl JobState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Delayed => "delayed",
            Self::Buried => "buried",
        }
    }
}

#[derive(Debug, Clone)]
struct StubJob {
    tube: String,
    body: Vec<u8>,
    priority: u32,
    delay: u32,
    ttr: u32,
    state: JobState,
}

#[derive(Debug, Clone, Default)]
struct StubTube {
    reserved: u64,
    total_jobs: u64,
    paused_for: u32,
}

#[derive(Debug, Default)]
struct DaemonState {
    tubes: BTreeMap<String, StubTube>,
    jobs: BTreeMap<u64, StubJob>,
    next_id: u64,
    workers: u64,
    commands: Vec<String>,
    fault: Option<Fault>,
}

enum Reply {
    Send(Vec<u8>),
    Later(Duration, Vec<u8>),
    Hangup,
}

/// Démon simulé ; la boucle d'acceptation s'arrête au drop
pub struct StubDaemon {
    addr: SocketAddr,
    state: Arc<Mutex<DaemonState>>,
    accept_task: JoinHandle<()>,
}

impl StubDaemon {
    /// Démarre un démon avec le seul tube "default"
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let mut initial = DaemonState {
            next_id: 1,
            ..DaemonState::default()
        };
        initial.tubes.insert("default".into(), StubTube::default());
        let state = Arc::new(Mutex::new(initial));

        let shared = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, peer)) = listener.accept().await {
                log::info!("🔌 stub {} accepted {}", addr, peer);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    if let Err(e) = serve_client(socket, shared).await {
                        log::info!("stub client {} closed: {}", peer, e);
                    }
                });
            }
        });

        Ok(Self {
            addr,
            state,
            accept_task,
        })
    }

    /// Adresse "127.0.0.1:port"
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn add_tube(&self, name: &str) {
        self.lock().tubes.entry(name.to_string()).or_default();
    }

    pub fn tube_names(&self) -> Vec<String> {
        self.lock().tubes.keys().cloned().collect()
    }

    /// Dépose un job directement dans l'état voulu, renvoie son id
    pub fn seed_job(&self, tube: &str, body: &[u8], state: JobState) -> u64 {
        let mut daemon = self.lock();
        daemon.insert_job(tube, body.to_vec(), 1024, 0, 60, state)
    }

    /// Nombre de jobs réservés annoncé pour un tube
    pub fn set_reserved(&self, tube: &str, count: u64) {
        self.lock().tubes.entry(tube.to_string()).or_default().reserved = count;
    }

    pub fn set_workers(&self, count: u64) {
        self.lock().workers = count;
    }

    pub fn inject_fault(&self, fault: Fault) {
        self.lock().fault = Some(fault);
    }

    /// Commandes reçues, dans l'ordre, sans le corps des `put`
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    pub fn job_body(&self, id: u64) -> Option<Vec<u8>> {
        self.lock().jobs.get(&id).map(|job| job.body.clone())
    }

    pub fn job_state(&self, id: u64) -> Option<JobState> {
        self.lock().jobs.get(&id).map(|job| job.state)
    }

    pub fn count_jobs(&self, tube: &str, state: JobState) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|job| job.tube == tube && job.state == state)
            .count()
    }

    pub fn paused_for(&self, tube: &str) -> Option<u32> {
        self.lock().tubes.get(tube).map(|t| t.paused_for)
    }

    fn lock(&self) -> MutexGuard<'_, DaemonState> {
        lock_state(&self.state)
    }
}

impl Drop for StubDaemon {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn lock_state(state: &Mutex<DaemonState>) -> MutexGuard<'_, DaemonState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn serve_client(socket: TcpStream, state: Arc<Mutex<DaemonState>>) -> std::io::Result<()> {
    let mut stream = BufStream::new(socket);
    let mut using = "default".to_string();

    loop {
        let mut raw = String::new();
        if stream.read_line(&mut raw).await? == 0 {
            return Ok(());
        }
        let line = raw.trim_end_matches(['\r', '\n']).to_string();

        let body = match put_body_len(&line) {
            Some(len) => {
                let mut buf = vec![0u8; len + 2];
                stream.read_exact(&mut buf).await?;
                buf.truncate(len);
                Some(buf)
            }
            None => None,
        };

        let reply = {
            let mut daemon = lock_state(&state);
            daemon.commands.push(line.clone());
            match daemon.fault.take() {
                Some(Fault::Disconnect) => Reply::Hangup,
                Some(Fault::Garbage) => Reply::Send(b"GARBAGE\r\n".to_vec()),
                Some(Fault::Slow(delay)) => Reply::Later(delay, daemon.handle(&line, body, &mut using)),
                None => Reply::Send(daemon.handle(&line, body, &mut using)),
            }
        };

        match reply {
            Reply::Hangup => return Ok(()),
            Reply::Send(bytes) => {
                stream.write_all(&bytes).await?;
                stream.flush().await?;
            }
            Reply::Later(delay, bytes) => {
                tokio::time::sleep(delay).await;
                stream.write_all(&bytes).await?;
                stream.flush().await?;
            }
        }
    }
}

fn put_body_len(line: &str) -> Option<usize> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some("put") {
        return None;
    }
    parts.nth(3).and_then(|len| len.parse().ok())
}

fn status(line: &str) -> Vec<u8> {
    format!("{line}\r\n").into_bytes()
}

fn payload(yaml: &str) -> Vec<u8> {
    format!("OK {}\r\n{}\r\n", yaml.len(), yaml).into_bytes()
}

impl DaemonState {
    fn insert_job(
        &mut self,
        tube: &str,
        body: Vec<u8>,
        priority: u32,
        delay: u32,
        ttr: u32,
        state: JobState,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tubes.entry(tube.to_string()).or_default().total_jobs += 1;
        self.jobs.insert(
            id,
            StubJob {
                tube: tube.to_string(),
                body,
                priority,
                delay,
                ttr,
                state,
            },
        );
        id
    }

    fn count(&self, tube: Option<&str>, state: JobState) -> usize {
        self.jobs
            .values()
            .filter(|job| job.state == state && tube.map_or(true, |t| job.tube == t))
            .count()
    }

    fn handle(&mut self, line: &str, body: Option<Vec<u8>>, using: &mut String) -> Vec<u8> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            ["list-tubes"] => {
                let mut yaml = String::from("---\n");
                for name in self.tubes.keys() {
                    yaml.push_str(&format!("- {name}\n"));
                }
                payload(&yaml)
            }
            ["stats"] => payload(&self.global_stats_yaml()),
            ["stats-tube", tube] => match self.tube_stats_yaml(tube) {
                Some(yaml) => payload(&yaml),
                None => status("NOT_FOUND"),
            },
            ["use", tube] => {
                self.tubes.entry(tube.to_string()).or_default();
                *using = tube.to_string();
                status(&format!("USING {tube}"))
            }
            ["put", priority, delay, ttr, _len] => {
                let (Ok(priority), Ok(delay), Ok(ttr)) =
                    (priority.parse::<u32>(), delay.parse::<u32>(), ttr.parse::<u32>())
                else {
                    return status("BAD_FORMAT");
                };
                let state = if delay > 0 { JobState::Delayed } else { JobState::Ready };
                let tube = using.clone();
                let id = self.insert_job(&tube, body.unwrap_or_default(), priority, delay, ttr, state);
                status(&format!("INSERTED {id}"))
            }
            ["peek-ready"] => self.peek(using, JobState::Ready),
            ["peek-delayed"] => self.peek(using, JobState::Delayed),
            ["peek-buried"] => self.peek(using, JobState::Buried),
            ["stats-job", id] => match id.parse::<u64>().ok().and_then(|id| self.job_stats_yaml(id)) {
                Some(yaml) => payload(&yaml),
                None => status("NOT_FOUND"),
            },
            ["delete", id] => match id.parse::<u64>().ok().and_then(|id| self.jobs.remove(&id)) {
                Some(_) => status("DELETED"),
                None => status("NOT_FOUND"),
            },
            ["pause-tube", tube, delay] => match (self.tubes.get_mut(*tube), delay.parse::<u32>()) {
                (Some(stub), Ok(delay)) => {
                    stub.paused_for = delay;
                    status("PAUSED")
                }
                (None, _) => status("NOT_FOUND"),
                (_, Err(_)) => status("BAD_FORMAT"),
            },
            ["kick", bound] => match bound.parse::<usize>() {
                Ok(bound) => status(&format!("KICKED {}", self.kick(using, bound))),
                Err(_) => status("BAD_FORMAT"),
            },
            _ => status("UNKNOWN_COMMAND"),
        }
    }

    fn peek(&self, tube: &str, state: JobState) -> Vec<u8> {
        let found = self
            .jobs
            .iter()
            .find(|(_, job)| job.tube == tube && job.state == state);
        match found {
            Some((id, job)) => {
                let mut reply = format!("FOUND {} {}\r\n", id, job.body.len()).into_bytes();
                reply.extend_from_slice(&job.body);
                reply.extend_from_slice(b"\r\n");
                reply
            }
            None => status("NOT_FOUND"),
        }
    }

    // buried d'abord, delayed seulement s'il n'y a aucun buried
    fn kick(&mut self, tube: &str, bound: usize) -> usize {
        let source = if self.count(Some(tube), JobState::Buried) > 0 {
            JobState::Buried
        } else {
            JobState::Delayed
        };
        let mut kicked = 0;
        for job in self.jobs.values_mut() {
            if kicked == bound {
                break;
            }
            if job.tube == tube && job.state == source {
                job.state = JobState::Ready;
                kicked += 1;
            }
        }
        kicked
    }

    fn global_stats_yaml(&self) -> String {
        let reserved: u64 = self.tubes.values().map(|t| t.reserved).sum();
        let total: u64 = self.tubes.values().map(|t| t.total_jobs).sum();
        format!(
            "---\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: {}\ncurrent-jobs-reserved: {}\n\
             current-jobs-delayed: {}\ncurrent-jobs-buried: {}\ntotal-jobs: {}\n\
             current-tubes: {}\ncurrent-connections: 1\ncurrent-workers: {}\n\
             pid: {}\nversion: \"1.13\"\nuptime: 42\nhostname: stub-beanstalkd\n",
            self.count(None, JobState::Ready),
            reserved,
            self.count(None, JobState::Delayed),
            self.count(None, JobState::Buried),
            total,
            self.tubes.len(),
            self.workers,
            std::process::id(),
        )
    }

    fn tube_stats_yaml(&self, tube: &str) -> Option<String> {
        let stub = self.tubes.get(tube)?;
        Some(format!(
            "---\nname: {}\ncurrent-jobs-urgent: 0\ncurrent-jobs-ready: {}\n\
             current-jobs-reserved: {}\ncurrent-jobs-delayed: {}\ncurrent-jobs-buried: {}\n\
             total-jobs: {}\ncurrent-using: 1\ncurrent-watching: 1\ncurrent-waiting: 0\n\
             cmd-delete: 0\ncmd-pause-tube: 0\npause: {}\npause-time-left: {}\n",
            tube,
            self.count(Some(tube), JobState::Ready),
            stub.reserved,
            self.count(Some(tube), JobState::Delayed),
            self.count(Some(tube), JobState::Buried),
            stub.total_jobs,
            stub.paused_for,
            stub.paused_for,
        ))
    }

    fn job_stats_yaml(&self, id: u64) -> Option<String> {
        let job = self.jobs.get(&id)?;
        Some(format!(
            "---\nid: {}\ntube: {}\nstate: {}\npri: {}\nage: 0\ndelay: {}\nttr: {}\n\
             time-left: 0\nfile: 0\nreserves: 0\ntimeouts: 0\nreleases: 0\nburies: 0\nkicks: 0\n",
            id,
            job.tube,
            job.state.as_str(),
            job.priority,
            job.delay,
            job.ttr,
        ))
    }
}

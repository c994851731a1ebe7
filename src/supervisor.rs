use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::child::{self, ChildHandle, Fd, ProcessEvent};
use crate::config::AppConfig;
use crate::function_list::FunctionList;

const READINESS_PERIOD: Duration = Duration::from_millis(100);

struct SupervisedApp {
    process: Option<ChildHandle>,
    waiters: Vec<oneshot::Sender<i32>>,
    restart_after_exit: bool,
    require_start_time: Option<Instant>,
    readiness_task: Option<JoinHandle<()>>,
    checking: bool,
}

impl SupervisedApp {
    fn new() -> Self {
        Self {
            process: None,
            waiters: Vec::new(),
            restart_after_exit: false,
            require_start_time: None,
            readiness_task: None,
            checking: false,
        }
    }
}

/// Tracks one `SupervisedApp` per distinct application identity and
/// guarantees, for every `require`, that by completion the app is either
/// healthy or its failure is reported. Concurrent requires for the same app
/// while a start/check sequence is already in flight are coalesced onto a
/// single FIFO of completions.
pub struct Supervisor {
    apps: Mutex<HashMap<usize, Arc<Mutex<SupervisedApp>>>>,
    pub on_process_start: FunctionList<Arc<AppConfig>>,
    pub on_process_data: FunctionList<(Arc<AppConfig>, Fd, Vec<u8>)>,
    pub on_process_error: FunctionList<(Arc<AppConfig>, i32)>,
    pub on_process_exit: FunctionList<(Arc<AppConfig>, i32, Option<i32>)>,
}

impl Supervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            apps: Mutex::new(HashMap::new()),
            on_process_start: FunctionList::new(),
            on_process_data: FunctionList::new(),
            on_process_error: FunctionList::new(),
            on_process_exit: FunctionList::new(),
        })
    }

    /// Ensures `config`'s application is healthy, starting/restarting it as
    /// needed, and resolves with an error code (0 = healthy).
    pub async fn require(self: &Arc<Self>, config: Arc<AppConfig>) -> i32 {
        let app = self.get_or_create(&config).await;
        let (tx, rx) = oneshot::channel();

        let is_driver = {
            let mut guard = app.lock().await;
            guard.waiters.push(tx);
            guard.waiters.len() == 1
        };

        if is_driver {
            let me = self.clone();
            tokio::spawn(async move { me.drive(app, config).await });
        }

        rx.await.unwrap_or(-1)
    }

    async fn get_or_create(&self, config: &Arc<AppConfig>) -> Arc<Mutex<SupervisedApp>> {
        let identity = config.identity();
        let mut apps = self.apps.lock().await;
        apps.entry(identity)
            .or_insert_with(|| Arc::new(Mutex::new(SupervisedApp::new())))
            .clone()
    }

    /// Runs the checker-then-start sequence for the driver of a `require`
    /// call. Always ends by calling `drain`, either directly or indirectly
    /// via the readiness loop / exit watcher it may hand off to.
    async fn drive(self: Arc<Self>, app: Arc<Mutex<SupervisedApp>>, config: Arc<AppConfig>) {
        match &config.checker {
            Some(checker) => {
                let has_process = app.lock().await.process.is_some();
                let result = child::run_to_completion(checker).await;

                if result == 0 {
                    // A checker is configured and it passed: the app is
                    // already healthy by definition, whether or not we can
                    // see a process for it (it may be healthy through some
                    // means outside this supervisor's view). Do not spawn.
                    self.drain(&app, 0).await;
                    return;
                } else if has_process {
                    self.trigger_restart(&app).await;
                    // The exit watcher spawned for the running process re-enters
                    // start_sequence once it observes the exit; this call's
                    // waiter stays queued until that sequence drains it.
                    return;
                }
                // No process alive; checker failure here is not actionable,
                // fall through and attempt a fresh start.
            }
            None => {
                if app.lock().await.process.is_some() {
                    self.drain(&app, 0).await;
                    return;
                }
            }
        }

        self.start_sequence(app, config).await;
    }

    async fn trigger_restart(&self, app: &Arc<Mutex<SupervisedApp>>) {
        let mut guard = app.lock().await;
        guard.restart_after_exit = true;
        if let Some(handle) = &guard.process {
            let _ = handle.kill_process_group(Signal::SIGTERM);
        }
    }

    async fn start_sequence(self: Arc<Self>, app: Arc<Mutex<SupervisedApp>>, config: Arc<AppConfig>) {
        {
            let mut guard = app.lock().await;
            guard.require_start_time = Some(Instant::now());
        }

        let failures = self.run_preambles(&config).await;
        if failures > 0 {
            self.drain(&app, failures as i32).await;
            return;
        }

        match child::spawn_supervised(&config.command) {
            Ok((handle, events)) => {
                {
                    let mut guard = app.lock().await;
                    guard.process = Some(handle);
                }
                self.on_process_start.call(config.clone()).await;
                self.spawn_exit_watcher(app.clone(), config.clone(), events);

                // Healthy-once-running is itself a readiness condition (the
                // no-checker case just always passes it); run it through the
                // same readiness loop rather than draining 0 immediately, so
                // a process that exits right away is drained by the exit
                // handler with its real exit code instead of racing it.
                self.spawn_readiness_loop(app, config).await;
            }
            Err(e) => {
                let errno = extract_errno(&e);
                self.on_process_error.call((config.clone(), errno)).await;
                self.drain(&app, errno).await;
            }
        }
    }

    async fn run_preambles(self: &Arc<Self>, config: &Arc<AppConfig>) -> usize {
        let mut handles = Vec::with_capacity(config.preamble.len());
        for preamble in &config.preamble {
            let me = self.clone();
            let preamble = preamble.clone();
            handles.push(tokio::spawn(async move { me.require(preamble).await }));
        }

        let mut failures = 0;
        for handle in handles {
            match handle.await {
                Ok(0) => {}
                Ok(_) | Err(_) => failures += 1,
            }
        }
        failures
    }

    fn spawn_exit_watcher(
        self: &Arc<Self>,
        app: Arc<Mutex<SupervisedApp>>,
        config: Arc<AppConfig>,
        mut events: mpsc::Receiver<ProcessEvent>,
    ) {
        let me = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Data { fd, bytes } => {
                        me.on_process_data.call((config.clone(), fd, bytes)).await;
                    }
                    ProcessEvent::Error(errno) => {
                        me.on_process_error.call((config.clone(), errno)).await;
                    }
                    ProcessEvent::Exit { code, signal } => {
                        me.clone().handle_exit(app.clone(), config.clone(), code, signal).await;
                        break;
                    }
                }
            }
        });
    }

    async fn handle_exit(
        self: Arc<Self>,
        app: Arc<Mutex<SupervisedApp>>,
        config: Arc<AppConfig>,
        code: i32,
        signal: Option<i32>,
    ) {
        self.on_process_exit
            .call((config.clone(), code, signal))
            .await;

        let restart = {
            let mut guard = app.lock().await;
            guard.process = None;
            let restart = guard.restart_after_exit;
            guard.restart_after_exit = false;
            restart
        };

        if restart {
            // A fresh readiness loop is about to be spawned for the new
            // process by start_sequence; abort the old one so it doesn't
            // keep probing concurrently with the new one. Not done for the
            // no-restart cases below: the original never cancels its timer
            // on exit either, so a still-running loop is left to notice the
            // waiters have cleared, or to drain on max_start_time_ms.
            let stale_task = { app.lock().await.readiness_task.take() };
            if let Some(task) = stale_task {
                task.abort();
            }
            self.start_sequence(app, config).await;
            return;
        }

        if config.checker.is_none() {
            let folded = if code != 0 { code } else { signal.unwrap_or(0) };
            self.drain(&app, folded).await;
        }
        // A checker is configured and no restart was pending: any queued
        // requirers are left for the still-running readiness loop (if any)
        // to drain once it next ticks, exactly like the original's
        // un-cancelled timer — not drained directly by this exit.
    }

    async fn spawn_readiness_loop(
        self: &Arc<Self>,
        app: Arc<Mutex<SupervisedApp>>,
        config: Arc<AppConfig>,
    ) {
        let me = self.clone();
        let loop_app = app.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(READINESS_PERIOD);
            loop {
                ticker.tick().await;

                let (still_wanted, already_checking) = {
                    let guard = loop_app.lock().await;
                    (!guard.waiters.is_empty(), guard.checking)
                };
                if !still_wanted {
                    return;
                }
                if already_checking {
                    continue;
                }

                let Some(checker) = config.checker.clone() else {
                    // No checker configured: being alive (still a process
                    // slot at the time of our last check) is itself health.
                    // Still funnelled through this tick-delayed loop rather
                    // than drained at spawn time, so a process that exits
                    // immediately loses the race to the exit handler, which
                    // drains the real exit code first.
                    me.drain(&loop_app, 0).await;
                    return;
                };

                { loop_app.lock().await.checking = true; }
                let result = child::run_to_completion(&checker).await;
                { loop_app.lock().await.checking = false; }

                if result == 0 || result == -(nix::errno::Errno::ENOENT as i32) {
                    me.drain(&loop_app, 0).await;
                    return;
                }

                let deadline_exceeded = {
                    let guard = loop_app.lock().await;
                    config.max_start_time_ms > 0
                        && guard
                            .require_start_time
                            .map(|start| start.elapsed().as_millis() as u64 >= config.max_start_time_ms)
                            .unwrap_or(false)
                };
                if deadline_exceeded {
                    me.drain(&loop_app, result).await;
                    return;
                }
            }
        });
        app.lock().await.readiness_task = Some(handle);
    }

    async fn drain(self: &Arc<Self>, app: &Arc<Mutex<SupervisedApp>>, code: i32) {
        let waiters = {
            let mut guard = app.lock().await;
            std::mem::take(&mut guard.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(code);
        }
    }
}

fn extract_errno(e: &anyhow::Error) -> i32 {
    for cause in e.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(errno) = io.raw_os_error() {
                return -errno;
            }
        }
    }
    -1
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CommandConfig;

    fn command(file: &str, args: &[&str]) -> CommandConfig {
        CommandConfig {
            file: file.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: vec![],
            cwd: None,
            timeout_ms: 0,
        }
    }

    fn app(command: CommandConfig, checker: Option<CommandConfig>) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            name: None,
            command,
            checker,
            max_start_time_ms: 0,
            preamble: vec![],
            tags: vec![],
        })
    }

    #[tokio::test]
    async fn require_succeeds_for_a_process_with_no_checker() {
        let supervisor = Supervisor::new();
        let config = app(command("/bin/sleep", &["5"]), None);
        let code = supervisor.require(config).await;
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn require_reports_spawn_failure() {
        let supervisor = Supervisor::new();
        let config = app(command("/definitely/not/a/binary", &[]), None);
        let code = supervisor.require(config).await;
        assert!(code < 0);
    }

    #[tokio::test]
    async fn concurrent_requires_coalesce_onto_one_start() {
        let supervisor = Supervisor::new();
        let config = app(command("/bin/sleep", &["2"]), None);

        let a = supervisor.clone().require(config.clone());
        let b = supervisor.clone().require(config.clone());
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra, 0);
        assert_eq!(rb, 0);
    }

    #[tokio::test]
    async fn readiness_loop_retries_until_checker_passes() {
        let supervisor = Supervisor::new();
        // Checker fails on first invocation by consulting a marker file that
        // the command's own first run creates; fails once, then succeeds.
        let marker = tempfile::NamedTempFile::new().unwrap();
        let marker_path = marker.path().to_path_buf();
        std::fs::remove_file(&marker_path).unwrap();

        let checker = command(
            "/bin/sh",
            &[
                "-c",
                &format!(
                    "test -f {p} && exit 0 || (touch {p} && exit 1)",
                    p = marker_path.display()
                ),
            ],
        );
        let config = app(command("/bin/sleep", &["2"]), Some(checker));
        let code = supervisor.require(config).await;
        assert_eq!(code, 0);
    }
}

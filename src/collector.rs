//! Peer-table collector.
//!
//! Every run appends one block to the log:
//!
//! ```text
//! === 2024-06-01 12:00:00 UTC ===
//! <peer table, verbatim, errors included>
//! <blank line>
//! ```
//!
//! A failing peer query never aborts the append; whatever it printed
//! (or the reason it could not run) becomes the block body.
//!
//! The in-container cron job writes its blocks in three pieces, so it must
//! stay the only writer of the bind-mounted log while the container runs.
//! [`MountedLogGuard`] enforces that for host-side collection.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::HarnessError;
use crate::image::TIMESTAMP_FORMAT;
use crate::runtime::ContainerRuntime;
use crate::types::ContainerState;

/// Source of the textual peer table.
#[async_trait]
pub trait PeerQuery: Send + Sync {
    /// Never fails: errors are rendered into the returned text.
    async fn peer_table(&self) -> String;
}

/// Runs the query on this machine. stderr is folded into stdout by the
/// shell so the text keeps arrival order, as the cron job's `2>&1` does.
pub struct LocalQuery {
    cmd: Vec<String>,
}

impl LocalQuery {
    pub fn new(cmd: Vec<String>) -> Self {
        Self { cmd }
    }
}

#[async_trait]
impl PeerQuery for LocalQuery {
    async fn peer_table(&self) -> String {
        let Some(program) = self.cmd.first() else {
            return "peer query: no command configured\n".to_string();
        };
        let output = Command::new("sh")
            .arg("-c")
            .arg("exec \"$@\" 2>&1")
            .arg("sh")
            .args(&self.cmd)
            .output()
            .await;
        match output {
            Ok(out) => {
                if !out.status.success() {
                    warn!("{} exited with {}", self.cmd.join(" "), out.status);
                }
                let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&out.stderr));
                text
            }
            Err(e) => {
                warn!("failed to run {} through sh: {}", program, e);
                format!("{}: {}\n", program, e)
            }
        }
    }
}

/// Runs the query inside the lab container.
pub struct ContainerQuery<'a, R> {
    runtime: &'a R,
    container: String,
    cmd: Vec<String>,
}

impl<'a, R> ContainerQuery<'a, R> {
    pub fn new(runtime: &'a R, container: String, cmd: Vec<String>) -> Self {
        Self {
            runtime,
            container,
            cmd,
        }
    }
}

#[async_trait]
impl<'a, R: ContainerRuntime> PeerQuery for ContainerQuery<'a, R> {
    async fn peer_table(&self) -> String {
        match self.runtime.exec(&self.container, &self.cmd).await {
            Ok(out) => {
                if !out.success() {
                    warn!(
                        "{} in {} exited with {:?}",
                        self.cmd.join(" "),
                        self.container,
                        out.exit_code
                    );
                }
                out.output
            }
            Err(e) => {
                warn!("peer query in {} failed: {}", self.container, e);
                format!("{}: {}\n", self.cmd.join(" "), e)
            }
        }
    }
}

/// Render one log block.
pub fn format_block(at: DateTime<Utc>, peers: &str) -> String {
    let mut block = format!("=== {} ===\n", at.format(TIMESTAMP_FORMAT));
    block.push_str(peers);
    if !peers.is_empty() && !peers.ends_with('\n') {
        block.push('\n');
    }
    block.push('\n');
    block
}

/// Checked before every append.
#[async_trait]
pub trait AppendGuard: Send + Sync {
    async fn check(&self, log_path: &Path) -> Result<()>;
}

/// Refuses appends to the bind-mounted log while the container is running.
pub struct MountedLogGuard<R> {
    runtime: Arc<R>,
    container: String,
    mounted_log: PathBuf,
}

impl<R> MountedLogGuard<R> {
    pub fn new(runtime: Arc<R>, container: String, mounted_log: PathBuf) -> Self {
        Self {
            runtime,
            container,
            mounted_log,
        }
    }
}

#[async_trait]
impl<R: ContainerRuntime + 'static> AppendGuard for MountedLogGuard<R> {
    async fn check(&self, log_path: &Path) -> Result<()> {
        if !same_location(log_path, &self.mounted_log) {
            return Ok(());
        }
        let state = self.runtime.state(&self.container).await?;
        if state == ContainerState::Running {
            return Err(HarnessError::LogInUse {
                path: log_path.to_path_buf(),
                container: self.container.clone(),
            }
            .into());
        }
        Ok(())
    }
}

/// Resolve `path` as far as the filesystem allows; the file itself may not
/// exist yet.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(p) = std::fs::canonicalize(path) {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            std::fs::canonicalize(parent)
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

pub fn same_location(a: &Path, b: &Path) -> bool {
    a == b || resolve(a) == resolve(b)
}

pub struct Collector<Q> {
    log_path: PathBuf,
    query: Q,
    guard: Option<Box<dyn AppendGuard>>,
}

impl<Q: PeerQuery> Collector<Q> {
    pub fn new(log_path: PathBuf, query: Q) -> Self {
        Self {
            log_path,
            query,
            guard: None,
        }
    }

    pub fn with_guard(mut self, guard: Box<dyn AppendGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub async fn collect(&self) -> Result<()> {
        self.collect_at(Utc::now()).await
    }

    /// Append one block stamped `at`. Only the guard and log-file I/O can
    /// fail.
    pub async fn collect_at(&self, at: DateTime<Utc>) -> Result<()> {
        if let Some(guard) = &self.guard {
            guard.check(&self.log_path).await?;
        }
        let peers = self.query.peer_table().await;
        let block = format_block(at, &peers);

        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .with_context(|| format!("opening {}", self.log_path.display()))?;
        // one write per block keeps blocks contiguous
        file.write_all(block.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.log_path.display()))?;
        file.flush().await?;

        debug!(
            "appended {} bytes to {}",
            block.len(),
            self.log_path.display()
        );
        Ok(())
    }

    /// Collect now and then every `every` until Ctrl+C.
    pub async fn watch(&self, every: Duration) -> Result<()> {
        self.watch_until(every, async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, stopping collector"),
                Err(e) => error!("Unable to listen for shutdown signal: {}", e),
            }
        })
        .await
    }

    /// Collect now and then every `every` until `shutdown` resolves. Runs
    /// never overlap: a slow query pushes the next tick back.
    pub async fn watch_until<F>(&self, every: Duration, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Collecting into {} every {:?}",
            self.log_path.display(),
            every
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.collect().await {
                        error!("Collection failed: {:#}", e);
                        return Err(e);
                    }
                    println!("Collected peer table into {}", self.log_path.display());
                }
                _ = &mut shutdown => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::fake::FakeRuntime;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const TABLE: &str = "     remote           refid      st t when poll reach   delay   offset  jitter
==============================================================================
*ntp0.cam.ac.uk  .GPS.            1 u   12   64  377   14.201   -0.412   0.233
+ptbtime1.ptb.de .PTB.            1 u   40   64  377   25.870    1.021   0.410
";

    struct Fixed(&'static str);

    #[async_trait]
    impl PeerQuery for Fixed {
        async fn peer_table(&self) -> String {
            self.0.to_string()
        }
    }

    #[derive(Default)]
    struct Stats {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    /// Takes `delay` to answer and records when each call began.
    struct Slow {
        stats: Arc<Stats>,
        delay: Duration,
    }

    #[async_trait]
    impl PeerQuery for Slow {
        async fn peer_table(&self) -> String {
            self.stats.starts.lock().unwrap().push(Instant::now());
            let running = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.stats.max_in_flight.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
            "x\n".to_string()
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, h, m, 0).unwrap()
    }

    #[test]
    fn block_has_header_body_and_blank_line() {
        let block = format_block(at(12, 0), "line one");
        assert_eq!(block, "=== 2024-06-01 12:00:00 UTC ===\nline one\n\n");
        assert_eq!(
            format_block(at(12, 0), ""),
            "=== 2024-06-01 12:00:00 UTC ===\n\n"
        );
    }

    #[tokio::test]
    async fn each_run_appends_one_block_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("ntplog.txt");
        let collector = Collector::new(path.clone(), Fixed(TABLE));

        collector.collect_at(at(12, 0)).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        collector.collect_at(at(12, 20)).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        let per_block = TABLE.lines().count() + 2;
        assert_eq!(first.lines().count(), per_block);
        assert_eq!(second.lines().count(), 2 * per_block);
        assert!(second.starts_with(&first));

        let headers: Vec<_> = second.lines().filter(|l| l.starts_with("=== ")).collect();
        assert_eq!(
            headers,
            vec![
                "=== 2024-06-01 12:00:00 UTC ===",
                "=== 2024-06-01 12:20:00 UTC ===",
            ]
        );
    }

    #[tokio::test]
    async fn existing_log_is_never_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntplog.txt");
        std::fs::write(&path, "earlier\n").unwrap();

        Collector::new(path.clone(), Fixed("x\n"))
            .collect_at(at(1, 0))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "earlier\n=== 2024-06-01 01:00:00 UTC ===\nx\n\n"
        );
    }

    #[tokio::test]
    async fn local_query_failure_is_logged_as_text() {
        let query = LocalQuery::new(vec!["definitely-not-a-real-ntpq".into(), "-p".into()]);
        let text = query.peer_table().await;
        assert!(text.contains("definitely-not-a-real-ntpq"));
    }

    #[tokio::test]
    async fn local_query_keeps_stderr_in_arrival_order() {
        let query = LocalQuery::new(vec![
            "sh".into(),
            "-c".into(),
            "echo first; echo second >&2; echo third".into(),
        ]);
        assert_eq!(query.peer_table().await, "first\nsecond\nthird\n");
    }

    #[tokio::test]
    async fn mounted_log_is_refused_while_container_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntp-logs").join("ntplog.txt");
        let rt = Arc::new(FakeRuntime::with("ntp-lab", ContainerState::Running));
        let guard = MountedLogGuard::new(Arc::clone(&rt), "ntp-lab".into(), path.clone());

        let err = Collector::new(path.clone(), Fixed(TABLE))
            .with_guard(Box::new(guard))
            .collect_at(at(12, 0))
            .await
            .unwrap_err();
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::LogInUse { path: refused, container }) => {
                assert_eq!(refused, &path);
                assert_eq!(container, "ntp-lab");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn mounted_log_is_writable_while_container_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntplog.txt");
        let rt = Arc::new(FakeRuntime::with("ntp-lab", ContainerState::Stopped));
        let guard = MountedLogGuard::new(rt, "ntp-lab".into(), path.clone());

        Collector::new(path.clone(), Fixed("x\n"))
            .with_guard(Box::new(guard))
            .collect_at(at(12, 0))
            .await
            .unwrap();
        assert!(path.is_file());
    }

    #[tokio::test]
    async fn separate_log_is_allowed_while_container_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mounted = dir.path().join("ntplog.txt");
        let own = dir.path().join("host-ntplog.txt");
        let rt = Arc::new(FakeRuntime::with("ntp-lab", ContainerState::Running));
        let guard = MountedLogGuard::new(rt, "ntp-lab".into(), mounted.clone());

        Collector::new(own.clone(), Fixed("x\n"))
            .with_guard(Box::new(guard))
            .collect_at(at(12, 0))
            .await
            .unwrap();
        assert!(own.is_file());
        assert!(!mounted.exists());
    }

    #[test]
    fn same_location_resolves_missing_files_through_their_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let plain = dir.path().join("ntplog.txt");
        let roundabout = dir.path().join("sub").join("..").join("ntplog.txt");
        assert_ne!(plain, roundabout);
        assert!(same_location(&plain, &roundabout));
        assert!(!same_location(&plain, &dir.path().join("other.txt")));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_collects_at_once_and_never_overlaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntplog.txt");
        let stats = Arc::new(Stats::default());
        let collector = Collector::new(
            path.clone(),
            Slow {
                stats: Arc::clone(&stats),
                delay: Duration::from_secs(25),
            },
        );

        let begin = Instant::now();
        collector
            .watch_until(
                Duration::from_secs(10),
                tokio::time::sleep(Duration::from_secs(100)),
            )
            .await
            .unwrap();

        let starts = stats.starts.lock().unwrap().clone();
        assert_eq!(starts[0], begin);
        assert!(starts.len() >= 3, "only {} runs", starts.len());
        assert_eq!(stats.max_in_flight.load(Ordering::SeqCst), 1);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(25));
        }

        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(log.matches("=== ").count(), starts.len());
    }

    #[tokio::test]
    async fn container_query_uses_exec_output() {
        let rt = FakeRuntime::with("ntp-lab", ContainerState::Running);
        rt.reply(&["ntpq", "-p"], 0, TABLE);
        let query = ContainerQuery::new(&rt, "ntp-lab".into(), vec!["ntpq".into(), "-p".into()]);
        assert_eq!(query.peer_table().await, TABLE);
    }

    #[tokio::test]
    async fn stopped_container_error_lands_in_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ntplog.txt");
        let rt = FakeRuntime::with("ntp-lab", ContainerState::Stopped);
        let query = ContainerQuery::new(&rt, "ntp-lab".into(), vec!["ntpq".into(), "-p".into()]);

        Collector::new(path.clone(), query)
            .collect_at(at(3, 40))
            .await
            .unwrap();
        let log = std::fs::read_to_string(&path).unwrap();
        assert!(log.starts_with("=== 2024-06-01 03:40:00 UTC ===\nntpq -p: "));
        assert!(log.contains("not running"));
        assert!(log.ends_with("\n\n"));
    }
}

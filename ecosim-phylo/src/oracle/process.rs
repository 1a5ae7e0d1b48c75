//! Oracle backed by an external solver executable.
//!
//! Each call writes `demarcation_in_<iteration>.dat` into the work directory,
//! runs `program [args..] <input> <output>` and reads
//! `demarcation_out_<iteration>.dat`. The iteration tag keeps concurrent calls
//! from clobbering each other's files.
//!
//! Both files are removed after every call, failed or not, unless the oracle
//! was told to keep them. On unix the solver runs in its own process group
//! and a timeout kills the whole group.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use ecosim_core::{EcosimError, Result};
use tracing::{debug, warn};

use super::{codec, DemarcationOracle, OracleRequest, OracleResponse};
use crate::config::OracleProcessConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long a failed call waits for the rest of the solver's stderr.
const STDERR_GRACE: Duration = Duration::from_millis(250);

/// Runs the external demarcation solver once per clade.
#[derive(Debug, Clone)]
pub struct ProcessOracle {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Duration,
    keep_files: bool,
}

impl ProcessOracle {
    /// A solver at `program` exchanging files in `work_dir`, with a ten
    /// minute limit per call.
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
            timeout: Duration::from_secs(600),
            keep_files: false,
        }
    }

    /// # Errors
    ///
    /// [`EcosimError::Config`] if the timeout is not a usable duration.
    pub fn from_config(config: &OracleProcessConfig) -> Result<Self> {
        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            work_dir: config.work_dir.clone(),
            timeout: config.timeout()?,
            keep_files: config.keep_files,
        })
    }

    /// Arguments placed before the input and output paths.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Leave request and response files in place after every call.
    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    pub fn input_path(&self, iteration: usize) -> PathBuf {
        self.work_dir
            .join(format!("demarcation_in_{}.dat", iteration))
    }

    pub fn output_path(&self, iteration: usize) -> PathBuf {
        self.work_dir
            .join(format!("demarcation_out_{}.dat", iteration))
    }

    fn run(&self, iteration: usize, input: &Path, output: &Path) -> Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        own_process_group(&mut command);
        let mut child = command.spawn().map_err(|e| {
            EcosimError::OracleInvocation(format!(
                "could not start '{}': {}",
                self.program.display(),
                e
            ))
        })?;

        // Drain stderr on its own thread so a chatty solver cannot fill the
        // pipe and stall. Anything the solver leaves running may hold the
        // pipe open, so the text is only awaited briefly and only on failure.
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text);
            }
            let _ = tx.send(text);
        });

        let status = self.wait(&mut child, iteration)?;
        if status.success() {
            return Ok(());
        }
        let stderr = rx.recv_timeout(STDERR_GRACE).unwrap_or_default();
        let detail = stderr.trim();
        Err(EcosimError::OracleInvocation(if detail.is_empty() {
            format!("'{}' exited with {}", self.program.display(), status)
        } else {
            format!(
                "'{}' exited with {}: {}",
                self.program.display(),
                status,
                detail
            )
        }))
    }

    fn wait(&self, child: &mut Child, iteration: usize) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                warn!(
                    iteration,
                    program = %self.program.display(),
                    "oracle exceeded {:?}, killing it", self.timeout
                );
                kill_tree(child);
                let _ = child.wait();
                return Err(EcosimError::OracleTimeout {
                    iteration,
                    timeout: self.timeout,
                });
            }
            thread::sleep(POLL_INTERVAL.min(self.timeout - elapsed));
        }
    }

    fn exchange(
        &self,
        request: &OracleRequest,
        input: &Path,
        output: &Path,
    ) -> Result<OracleResponse> {
        if output.exists() {
            fs::remove_file(output)?;
        }
        fs::write(input, codec::write_request(request))?;

        debug!(
            iteration = request.iteration,
            sample_size = request.sample_size,
            levels = request.bins.len(),
            "running oracle"
        );
        let started = Instant::now();
        self.run(request.iteration, input, output)?;

        let text = fs::read_to_string(output).map_err(|e| {
            EcosimError::OracleInvocation(format!(
                "could not read response '{}': {}",
                output.display(),
                e
            ))
        })?;
        let response = codec::parse_response(&text, request.omega, request.sigma)?;
        debug!(
            iteration = request.iteration,
            elapsed_ms = started.elapsed().as_millis() as u64,
            single = response.single.likelihood,
            npop = response.most_likely.npop,
            "oracle answered"
        );
        Ok(response)
    }

    fn cleanup(&self, paths: &[&Path]) {
        for path in paths {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), "could not remove oracle file: {}", err);
                }
            }
        }
    }
}

impl DemarcationOracle for ProcessOracle {
    fn estimate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        fs::create_dir_all(&self.work_dir)?;
        let input = self.input_path(request.iteration);
        let output = self.output_path(request.iteration);
        let outcome = self.exchange(request, &input, &output);
        if !self.keep_files {
            self.cleanup(&[input.as_path(), output.as_path()]);
        } else if outcome.is_err() {
            debug!(
                iteration = request.iteration,
                input = %input.display(),
                "keeping files of failed oracle call"
            );
        }
        outcome
    }
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// Kill the solver and, on unix, everything in its process group.
#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) takes plain integers and touches no memory of ours.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::binning::BinLevel;
    use crate::oracle::AveragingCriterion;

    fn request(iteration: usize) -> OracleRequest {
        OracleRequest {
            iteration,
            bins: vec![BinLevel::new(0.9, 1), BinLevel::new(1.0, 3)],
            omega: 0.2,
            sigma: 0.4,
            npop: 2,
            step: 1.5,
            sample_size: 3,
            replicates: 10,
            seed: 12345,
            sequence_length: 800,
            averaging: AveragingCriterion::default(),
            likelihood_solution: 0.01,
        }
    }

    /// A solver implemented as a shell script run through `/bin/sh`.
    fn scripted(dir: &Path, body: &str) -> ProcessOracle {
        let script = dir.join("solver.sh");
        fs::write(&script, body).unwrap();
        ProcessOracle::new("/bin/sh", dir.join("work")).with_args([script.display().to_string()])
    }

    #[test]
    fn successful_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(
            dir.path(),
            "grep -q numcrit \"$1\" || exit 9\n\
             printf 'npop 1 likelihood 0.125\\nnpop 2 likelihood 0.5\\n' > \"$2\"\n",
        );
        let response = oracle.estimate(&request(1)).unwrap();
        assert_eq!(response.single.npop, 1);
        assert_eq!(response.single.likelihood, 0.125);
        assert_eq!(response.most_likely.npop, 2);
        assert_eq!(response.most_likely.omega, 0.2);
        assert!(!oracle.input_path(1).exists());
        assert!(!oracle.output_path(1).exists());
    }

    #[test]
    fn keeps_files_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(
            dir.path(),
            "printf 'npop 1 likelihood 0.1\\nnpop 1 likelihood 0.1\\n' > \"$2\"\n",
        )
        .keep_files(true);
        oracle.estimate(&request(4)).unwrap();
        let written = fs::read_to_string(oracle.input_path(4)).unwrap();
        assert_eq!(codec::parse_request(&written, 4).unwrap(), request(4));
        assert!(oracle.output_path(4).exists());
    }

    #[test]
    fn nonzero_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(dir.path(), "echo 'solver exploded' >&2\nexit 3\n");
        match oracle.estimate(&request(2)) {
            Err(EcosimError::OracleInvocation(msg)) => assert!(msg.contains("solver exploded")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_response_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(dir.path(), "exit 0\n");
        assert!(matches!(
            oracle.estimate(&request(3)),
            Err(EcosimError::OracleInvocation(_))
        ));
    }

    #[test]
    fn malformed_response_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(dir.path(), "echo 'npop 1' > \"$2\"\n");
        assert!(matches!(
            oracle.estimate(&request(5)),
            Err(EcosimError::OracleInvocation(_))
        ));
    }

    #[test]
    fn hung_solver_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let oracle =
            scripted(dir.path(), "exec sleep 30\n").with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        match oracle.estimate(&request(6)) {
            Err(EcosimError::OracleTimeout { iteration, .. }) => assert_eq!(iteration, 6),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn failed_calls_remove_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(dir.path(), "echo 'npop 1 likelihood 0.5' > \"$2\"\nexit 4\n");
        assert!(oracle.estimate(&request(9)).is_err());
        assert!(!oracle.input_path(9).exists());
        assert!(!oracle.output_path(9).exists());

        let oracle = oracle.keep_files(true);
        assert!(oracle.estimate(&request(9)).is_err());
        assert!(oracle.input_path(9).exists());
        assert!(oracle.output_path(9).exists());
    }

    #[test]
    fn lingering_background_job_does_not_delay_answer() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = scripted(
            dir.path(),
            "sleep 5 &\n\
             printf 'npop 1 likelihood 0.1\\nnpop 2 likelihood 0.2\\n' > \"$2\"\n",
        )
        .with_timeout(Duration::from_millis(500));
        let started = Instant::now();
        let response = oracle.estimate(&request(10)).unwrap();
        assert_eq!(response.most_likely.npop, 2);
        assert!(started.elapsed() < Duration::from_secs(3));

        let failing = scripted(dir.path(), "sleep 5 &\nexit 2\n")
            .with_timeout(Duration::from_millis(500));
        let started = Instant::now();
        assert!(matches!(
            failing.estimate(&request(11)),
            Err(EcosimError::OracleInvocation(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_the_whole_process_group() {
        fn running(pid: &str) -> bool {
            match fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Err(_) => false,
                Ok(stat) => !stat
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("background.pid");
        let oracle = scripted(
            dir.path(),
            &format!("sleep 30 &\necho $! > '{}'\nwait\n", pid_file.display()),
        )
        .with_timeout(Duration::from_millis(300));
        assert!(matches!(
            oracle.estimate(&request(12)),
            Err(EcosimError::OracleTimeout { iteration: 12, .. })
        ));
        let pid = fs::read_to_string(&pid_file).unwrap();
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(5);
        while running(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(!running(pid), "background job {} survived the timeout", pid);
    }

    #[test]
    fn config_with_unusable_timeout_is_rejected() {
        let mut config = OracleProcessConfig::default();
        let oracle = ProcessOracle::from_config(&config).unwrap();
        assert_eq!(oracle.timeout, Duration::from_secs(600));
        for bad in [1e20, -1.0, f64::NAN] {
            config.timeout_secs = bad;
            assert!(matches!(
                ProcessOracle::from_config(&config),
                Err(EcosimError::Config(_))
            ));
        }
    }

    #[test]
    fn missing_program_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = ProcessOracle::new(dir.path().join("no-such-solver"), dir.path());
        assert!(matches!(
            oracle.estimate(&request(7)),
            Err(EcosimError::OracleInvocation(_))
        ));
    }
}

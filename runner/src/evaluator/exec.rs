use super::{EvaluationError, EvaluationRequest, Evaluator};
use crate::{config::EvaluatorConfig, metrics::Evaluation};
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use std::{
    io::{self, Read, Write},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::Instant,
};
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

/// stderr is cut to its tail before it ends up in an outcome detail
const STDERR_TAIL: usize = 512;

/// Evaluator running an external executable per parameter set.
///
/// Invoked as `exec [params...] <job id> <dataset>`, with the parameter set as a JSON
/// object on stdin. The metrics are read from stdout as YAML (JSON works as well).
/// Every evaluation runs in its own process group, which is killed as a whole once the
/// evaluator exits or the job deadline passes.
#[derive(Debug, Clone)]
pub struct ExecEvaluator {
    pub exec: PathBuf,
    pub params: Vec<String>,
}

impl ExecEvaluator {
    pub fn load(config: &EvaluatorConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            params: config.params.clone(),
        }
    }
}

fn read_to_end(mut source: impl Read + Send + 'static) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = String::new();
        source.read_to_string(&mut buffer)?;

        Ok(buffer)
    })
}

fn join_reader(handle: Option<thread::JoinHandle<io::Result<String>>>) -> io::Result<String> {
    match handle {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "reader thread panicked"))),
        None => Ok(String::new()),
    }
}

fn tail(text: &str) -> String {
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map_or(0, |(index, _)| index);

    text[start..].to_string()
}

/// SIGKILL the process group led by `child`, i.e., the evaluator and anything it started
fn kill_group(child: &mut Child) {
    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(errno) => {
            warn!(error = %errno, "Failed to kill evaluator process group, killing the evaluator only");
            let _ = child.kill();
        }
    }
}

impl Evaluator for ExecEvaluator {
    #[tracing::instrument(level = "debug", skip_all, fields(job = request.job.id, combo = request.combo_index))]
    fn evaluate(&self, request: &EvaluationRequest<'_>) -> Result<Evaluation, EvaluationError> {
        let remaining = request.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EvaluationError::Timeout);
        }

        let input = serde_json::to_vec(request.parameters)?;
        let start = Instant::now();

        let mut child = Command::new(&self.exec)
            .args(self.params.iter())
            .arg(request.job.id.to_string())
            .arg(request.dataset)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(EvaluationError::Spawn)?;

        // drain both pipes concurrently so a chatty evaluator can't block on a full pipe
        let stdout = child.stdout.take().map(read_to_end);
        let stderr = child.stderr.take().map(read_to_end);

        if let Some(mut stdin) = child.stdin.take() {
            // dropping stdin closes the pipe, giving the evaluator a clear end of input
            if let Err(error) = stdin.write_all(&input) {
                warn!(error = %error, "Failed to hand parameters to evaluator");
            }
        }

        debug!("Evaluator waiting on {}", child.id());
        let status = match child.wait_timeout(remaining)? {
            Some(status) => status,
            None => {
                debug!("Evaluator ran into the job deadline, killing it");
                kill_group(&mut child);
                child.wait()?;
                // the readers finish on their own once the last pipe writer is gone
                drop((stdout, stderr));

                return Err(EvaluationError::Timeout);
            }
        };

        // leftovers started in the background would keep the pipes open
        kill_group(&mut child);

        let output = join_reader(stdout)?;
        let errors = join_reader(stderr)?;

        debug!(
            "Finished in {} ms | status: {}",
            start.elapsed().as_millis(),
            status.success()
        );
        trace!("Output: {output}");

        if !status.success() {
            return Err(EvaluationError::Failed {
                status: status.to_string(),
                stderr: tail(&errors),
            });
        }

        match serde_yaml::from_str::<Evaluation>(&output) {
            Ok(evaluation) => Ok(evaluation),
            Err(error) => {
                debug!(stderr = %errors, "Evaluator output isn't a metric document");

                Err(error.into())
            }
        }
    }
}

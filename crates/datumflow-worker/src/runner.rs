//! User-code execution.
//!
//! Spawns the pipeline's transform command in its own process group,
//! forwards its output line-by-line to the tagged logger, and enforces the
//! wall-clock budget: on expiry the group gets a termination signal and a
//! bounded grace period before the failure is escalated. Every exit path
//! reports exactly one deferred metrics sample.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use datumflow_types::stats::ProcessStats;

use crate::driver::Driver;
use crate::errors::DriverError;
use crate::logging::TaggedLogger;

/// Grace period between the post-timeout termination signal and escalation.
const TERM_GRACE: Duration = Duration::from_secs(10);

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    Canceled,
}

impl Driver {
    /// Run the pipeline's primary transform command for one datum.
    ///
    /// `extra_env` is merged over the transform's own environment. Elapsed
    /// wall time accumulates into `stats.process_secs`.
    ///
    /// # Errors
    ///
    /// [`DriverError::User`] on nonzero exit, [`DriverError::System`] when
    /// the process cannot be spawned, [`DriverError::Timeout`] /
    /// [`DriverError::TerminationFailed`] on budget expiry, and
    /// [`DriverError::Canceled`] when `ctx` fires.
    pub async fn run_user_code(
        &self,
        ctx: &CancellationToken,
        logger: &TaggedLogger,
        extra_env: &BTreeMap<String, String>,
        stats: &mut ProcessStats,
        timeout: Option<Duration>,
    ) -> Result<(), DriverError> {
        self.report_user_code_stats(logger);
        let start = Instant::now();
        let cmd = self.pipeline().transform.cmd.clone();
        let result = self.exec_transform(ctx, &cmd, extra_env, logger, timeout).await;
        stats.process_secs += start.elapsed().as_secs_f64();
        self.report_deferred_user_code_stats(&result, start, logger);
        result
    }

    /// Run the pipeline's error-handling command, if one is configured.
    ///
    /// Invoked by the caller only after the primary path fails; takes its
    /// own independent timeout so user cleanup gets a fresh budget.
    ///
    /// # Errors
    ///
    /// Same classification as [`Driver::run_user_code`].
    pub async fn run_user_error_handling_code(
        &self,
        ctx: &CancellationToken,
        logger: &TaggedLogger,
        extra_env: &BTreeMap<String, String>,
        stats: &mut ProcessStats,
        timeout: Option<Duration>,
    ) -> Result<(), DriverError> {
        let start = Instant::now();
        let cmd = self.pipeline().transform.err_cmd.clone();
        let result = self.exec_transform(ctx, &cmd, extra_env, logger, timeout).await;
        stats.process_secs += start.elapsed().as_secs_f64();
        self.report_deferred_user_code_stats(&result, start, logger);
        result
    }

    async fn exec_transform(
        &self,
        ctx: &CancellationToken,
        cmd: &[String],
        extra_env: &BTreeMap<String, String>,
        logger: &TaggedLogger,
        timeout: Option<Duration>,
    ) -> Result<(), DriverError> {
        let Some((program, args)) = cmd.split_first() else {
            return Err(DriverError::System(anyhow::anyhow!(
                "transform command is empty"
            )));
        };
        let transform = &self.pipeline().transform;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&transform.env)
            .envs(extra_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &transform.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            DriverError::System(
                anyhow::Error::new(e).context(format!("failed to start user code {program:?}")),
            )
        })?;
        let pid = child.id();
        logger.log(format!("running user code {program:?}"));

        let stdout_task = child
            .stdout
            .take()
            .map(|stream| forward_lines(stream, "stdout", logger.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| forward_lines(stream, "stderr", logger.clone()));

        let outcome = {
            let wait_limited = async {
                let waited = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                        Ok(waited) => waited,
                        Err(_) => return Ok(WaitOutcome::TimedOut),
                    },
                    None => child.wait().await,
                };
                waited
                    .map(WaitOutcome::Exited)
                    .map_err(|e| DriverError::System(e.into()))
            };
            tokio::select! {
                biased;
                () = ctx.cancelled() => Ok(WaitOutcome::Canceled),
                outcome = wait_limited => outcome,
            }
        }?;

        let result = match outcome {
            WaitOutcome::Exited(status) => {
                if status.success() {
                    Ok(())
                } else {
                    Err(DriverError::User {
                        exit_code: status.code(),
                    })
                }
            }
            WaitOutcome::TimedOut => {
                let limit_secs = timeout.map(|d| d.as_secs_f64()).unwrap_or_default();
                logger.log(format!(
                    "user code did not finish within {limit_secs}s; terminating process group"
                ));
                terminate_group(pid);
                match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    Ok(_) => Err(DriverError::Timeout { limit_secs }),
                    Err(_) => {
                        let _ = child.start_kill();
                        Err(DriverError::TerminationFailed {
                            grace_secs: TERM_GRACE.as_secs_f64(),
                        })
                    }
                }
            }
            WaitOutcome::Canceled => {
                terminate_group(pid);
                if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                    let _ = child.start_kill();
                }
                Err(DriverError::Canceled)
            }
        };

        // Drain the forwarders so the tail of the output is logged before
        // the outcome is reported.
        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        if let Err(err) = &result {
            logger.log(format!("user code failed: {err}"));
        }
        result
    }
}

fn forward_lines<R>(stream: R, name: &'static str, logger: TaggedLogger) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => logger.log(format!("[{name}] {line}")),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(stream = name, error = %e, "user code output stream closed");
                    break;
                }
            }
        }
    })
}

/// Send SIGTERM to the child's process group.
#[cfg(unix)]
fn terminate_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        #[allow(clippy::cast_possible_wrap)]
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "failed to signal user code process group");
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: Option<u32>) {}

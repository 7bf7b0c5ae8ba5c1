//! Three-tier session teardown.
//!
//! Tiers always run in the same order: protocol disconnect, process termination, port
//! release. A failing tier is logged and recorded, the remaining tiers still run.

use crate::config::Timeouts;
use crate::error::{Error, Result, Tier};
use crate::resource::orphan::ProcessSource;
use crate::resource::process::StopOutcome;
use crate::session::Session;
use serde_json::json;

/// Tier implementations for one session.
pub trait TeardownSteps {
    fn disconnect(&mut self) -> Result<()>;

    /// Stop backend processes, `None` when there is nothing to stop.
    fn terminate(&mut self) -> Result<Option<StopOutcome>>;

    fn release_port(&mut self) -> Result<()>;
}

/// What a teardown did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Tiers in execution order.
    pub tiers: Vec<Tier>,
    /// [`Error::CleanupFailure`] per failed tier.
    pub failures: Vec<Error>,
    pub stop: Option<StopOutcome>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failed(&self, tier: Tier) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, Error::CleanupFailure { tier: t, .. } if *t == tier))
    }
}

/// Run all tiers. Never fails, failures end up in the report.
pub fn run_teardown(label: &str, steps: &mut impl TeardownSteps) -> CleanupReport {
    let mut report = CleanupReport::default();

    let record = |report: &mut CleanupReport, tier: Tier, result: Result<()>| {
        report.tiers.push(tier);
        if let Err(e) = result {
            let failure = match e {
                e @ Error::CleanupFailure { .. } => e,
                e => Error::CleanupFailure {
                    tier,
                    message: e.to_string(),
                },
            };
            log::warn!(target: "resource", "{label}: {failure}");
            report.failures.push(failure);
        }
    };

    let disconnect = steps.disconnect();
    record(&mut report, Tier::Disconnect, disconnect);

    let terminate = steps.terminate().map(|outcome| {
        report.stop = outcome;
    });
    record(&mut report, Tier::Terminate, terminate);

    let release = steps.release_port();
    record(&mut report, Tier::ReleasePort, release);

    report
}

/// Teardown of a real [`Session`].
///
/// Child sessions share their parent's connection and process, for them only event routing
/// is detached and the process tiers are no-ops.
pub struct SessionTeardown<'a> {
    session: &'a Session,
    timeouts: Timeouts,
    /// Used to find processes of this session that left its process group.
    processes: &'a dyn ProcessSource,
}

impl<'a> SessionTeardown<'a> {
    pub fn new(session: &'a Session, timeouts: Timeouts, processes: &'a dyn ProcessSource) -> Self {
        Self {
            session,
            timeouts,
            processes,
        }
    }

    fn sweep_stragglers(&self) -> Result<()> {
        let id = self.session.id();
        let mut failures = vec![];
        for info in self
            .processes
            .snapshot()
            .into_iter()
            .filter(|p| p.tags.session_id == id)
        {
            log::debug!(
                target: "resource",
                "session {id}: stopping straggler `{}` (pid {})",
                info.name,
                info.pid
            );
            if let Err(e) = self.processes.terminate(info.pid, self.timeouts.process_stop()) {
                failures.push(format!("pid {}: {e}", info.pid));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::CleanupFailure {
                tier: Tier::Terminate,
                message: format!("stragglers survived: {}", failures.join(", ")),
            })
        }
    }
}

impl TeardownSteps for SessionTeardown<'_> {
    fn disconnect(&mut self) -> Result<()> {
        self.session.detach_events();
        if self.session.is_child() {
            return Ok(());
        }
        let client = self.session.client();
        if !client.is_connected() {
            log::debug!(target: "resource", "session {}: already disconnected", self.session.id());
            return Ok(());
        }
        let terminate_debuggee = self.session.process().is_some();
        let result = client
            .send_with_timeout(
                "disconnect",
                json!({ "restart": false, "terminateDebuggee": terminate_debuggee }),
                self.timeouts.disconnect(),
            )
            .and_then(|r| r.into_result())
            .map(|_| ());
        client.close();
        result
    }

    fn terminate(&mut self) -> Result<Option<StopOutcome>> {
        if self.session.is_child() {
            return Ok(None);
        }
        let Some(process) = self.session.process() else {
            return Ok(None);
        };
        let outcome = process.stop(self.timeouts.process_stop());
        if let Ok(outcome) = &outcome {
            log::debug!(
                target: "resource",
                "session {}: backend pid {} stopped ({outcome})",
                self.session.id(),
                process.pid()
            );
        }
        // daemonized grandchildren leave the group but keep the tags
        let swept = self.sweep_stragglers();
        let outcome = outcome?;
        swept?;
        Ok(Some(outcome))
    }

    fn release_port(&mut self) -> Result<()> {
        if let Some(lease) = self.session.take_port() {
            lease.release();
        }
        Ok(())
    }
}

//! Run a whole plan in one session and produce its report.

use tracing::{info, warn};

use super::{Session, SessionConfig};
use crate::error::{HarnessError, TransportError};
use crate::event::Request;
use crate::report::Report;
use crate::transport::{
    ChannelTransport, ConnectionInfo, ConsoleConfig, ConsoleTransport, Transport,
};
use crate::validate::{self, Expectations};

/// Where the kernel lives.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Channel(ConnectionInfo),
    Console(ConsoleConfig),
}

impl Target {
    pub fn describe(&self) -> String {
        match self {
            Target::Channel(info) => format!(
                "channel {}:{} (iopub {})",
                info.ip, info.shell_port, info.iopub_port
            ),
            Target::Console(config) => format!("console `{}`", config.display()),
        }
    }

    /// Connect to or spawn the kernel.
    pub async fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        match self {
            Target::Channel(info) => Ok(Box::new(ChannelTransport::connect(info).await?)),
            Target::Console(config) => Ok(Box::new(ConsoleTransport::spawn(config.clone())?)),
        }
    }
}

/// One turn of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTurn {
    pub label: String,
    pub request: Request,
    pub expectations: Expectations,
}

/// Everything needed to run one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub target: Target,
    /// Checks for console startup output; `None` skips the startup settle.
    pub startup: Option<Expectations>,
    pub turns: Vec<PlannedTurn>,
}

/// Open the plan's target and run every turn in one session.
///
/// Never fails: a transport failure aborts the remaining turns and is
/// recorded on the report. The session is torn down on every path.
pub async fn execute(plan: &Plan, config: &SessionConfig) -> Report {
    let mut report = Report::new(plan.target.describe());

    let transport = match plan.target.open().await {
        Ok(transport) => transport,
        Err(source) => {
            warn!(kernel = %report.target, error = %source, "could not open kernel");
            report.abort(&HarnessError::transport(source));
            report.finish();
            return report;
        }
    };

    let mut session = Session::new(transport, *config);
    info!(transport = session.transport_name(), turns = plan.turns.len(), "session opened");
    let outcome = drive(&mut session, plan, &mut report).await;
    if let Err(e) = &outcome {
        report.abort(e);
    }
    if let Err(e) = session.teardown().await {
        warn!(error = %e, "session teardown failed");
    }

    report.finish();
    info!(
        turns = report.turns.len(),
        passed = report.passed(),
        exit_code = report.exit_code(),
        "plan finished"
    );
    report
}

async fn drive(
    session: &mut Session,
    plan: &Plan,
    report: &mut Report,
) -> Result<(), HarnessError> {
    if let Some(expectations) = &plan.startup {
        match session.settle_startup(expectations).await {
            Ok(Some(startup)) => report.push(startup),
            Ok(None) => {}
            Err(e) => return Err(keep_partial(e, None, report)),
        }
    }
    for turn in &plan.turns {
        match session.run(&turn.request, &turn.expectations).await {
            Ok(mut turn_report) => {
                turn_report.label = turn.label.clone();
                report.push(turn_report);
            }
            Err(e) => return Err(keep_partial(e, Some(turn.label.as_str()), report)),
        }
    }

    let trailing = session.drain_trailing().await;
    if let (Some(verdict), Some(last)) = (validate::protocol_verdict(&trailing), report.turns.last_mut()) {
        last.verdicts.push(verdict);
    }
    Ok(())
}

/// Move the interrupted turn's report out of `error` into `report`.
fn keep_partial(mut error: HarnessError, label: Option<&str>, report: &mut Report) -> HarnessError {
    if let Some(mut partial) = error.take_partial() {
        if let Some(label) = label {
            partial.label = label.to_string();
        }
        report.push(partial);
    }
    error
}

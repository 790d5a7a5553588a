//! Admission control for monitored commands.
//!
//! `AdmissionController::execute` gates a work unit behind the command's
//! run rules (runs once, dependencies, conflicts, run limit) and drives its
//! `CommandRecord` through `start -> complete | fail`.
//!
//! Outcomes travel on two channels:
//! - expected results (admitted and completed, rejected, work failed) come
//!   back as `Ok(Outcome)` and always leave the record finalized;
//! - invariant violations (`AlreadyStarted`, `AlreadyFinalized`,
//!   `InvalidReentry`) and storage errors come back as `Err(LedgerError)`.
//!
//! Recursive commands re-enter through `RunContext::reentry`, which attaches
//! the nested run to the outer run's record. Only the outer (owning) run
//! finalizes a shared record on success; a failure at any depth fails it.

use crate::core::error::LedgerError;
use crate::plugins::records::{CommandRecord, JsonMap, RecordId, RecordOps, RecordStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::OnceLock;

pub fn validate_command_name(name: &str) -> Result<(), LedgerError> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").expect("static command name pattern")
    });
    if re.is_match(name) {
        Ok(())
    } else {
        Err(LedgerError::ValidationError(format!(
            "invalid command name '{}': use letters, digits, '_', '.', ':' or '-'",
            name
        )))
    }
}

/// Run rules for one named command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,
    /// Refuse to run once a run has completed, or while one is in progress.
    pub runs_once: bool,
    /// Every named command must have completed at least once.
    pub runs_if: Vec<String>,
    /// None of the named commands may have completed.
    pub doesnt_run_if: Vec<String>,
    /// Maximum attempts (requested or completed); negative means unlimited.
    pub run_limit: i64,
    /// The work unit may re-enter itself through `RunContext::reentry`.
    pub recursive: bool,
}

impl CommandDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            runs_once: false,
            runs_if: Vec::new(),
            doesnt_run_if: Vec::new(),
            run_limit: -1,
            recursive: false,
        }
    }

    pub fn runs_once(mut self, yes: bool) -> Self {
        self.runs_once = yes;
        self
    }

    pub fn runs_if<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.runs_if.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn doesnt_run_if<I, N>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.doesnt_run_if.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn run_limit(mut self, limit: i64) -> Self {
        self.run_limit = limit;
        self
    }

    pub fn recursive(mut self, yes: bool) -> Self {
        self.recursive = yes;
        self
    }
}

/// How an invocation finds its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "record_id", rename_all = "snake_case")]
pub enum Attachment {
    /// Create a new record.
    Fresh,
    /// Attach to an existing, unstarted record and run the full checks.
    Resume(RecordId),
    /// Recursive re-entry into a running record. Skips the checks and
    /// leaves finalization on success to the outer run.
    Nested(RecordId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub arguments: JsonMap,
    pub options: JsonMap,
    pub attachment: Attachment,
}

impl Invocation {
    pub fn new() -> Self {
        Self {
            arguments: JsonMap::new(),
            options: JsonMap::new(),
            attachment: Attachment::Fresh,
        }
    }

    pub fn resume(id: RecordId) -> Self {
        Self {
            attachment: Attachment::Resume(id),
            ..Self::new()
        }
    }

    /// Nested re-entry by id, for callers outside the running process (a
    /// child the work unit spawned). In-process work units use
    /// `RunContext::reentry` instead.
    pub fn nested(id: RecordId) -> Self {
        Self {
            attachment: Attachment::Nested(id),
            ..Self::new()
        }
    }

    pub fn with_argument(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.arguments.insert(key.to_string(), value.into());
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

/// What a running work unit knows about its invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub record_id: RecordId,
    pub name: String,
    pub arguments: JsonMap,
    pub options: JsonMap,
    /// True when this run re-entered an outer run's record.
    pub nested: bool,
}

impl RunContext {
    fn for_record(record: &CommandRecord) -> Self {
        Self {
            record_id: record.id,
            name: record.name.clone(),
            arguments: record.arguments.clone(),
            options: record.options.clone(),
            nested: false,
        }
    }

    /// Nested runs see the arguments they were re-entered with; the shared
    /// record keeps the outer run's snapshot.
    fn nested_in(record: &CommandRecord, invocation: Invocation) -> Self {
        Self {
            record_id: record.id,
            name: record.name.clone(),
            arguments: invocation.arguments,
            options: invocation.options,
            nested: true,
        }
    }

    /// An invocation that re-enters this run's record.
    pub fn reentry(&self) -> Invocation {
        Invocation {
            arguments: self.arguments.clone(),
            options: self.options.clone(),
            attachment: Attachment::Nested(self.record_id),
        }
    }
}

/// Value returned by a work unit; becomes the record's result text.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutput {
    Empty,
    Text(String),
    Structured(JsonValue),
}

impl WorkOutput {
    pub fn render(&self) -> String {
        match self {
            WorkOutput::Empty => String::new(),
            WorkOutput::Text(s) => s.clone(),
            WorkOutput::Structured(JsonValue::String(s)) => s.clone(),
            WorkOutput::Structured(v) => v.to_string(),
        }
    }
}

impl From<()> for WorkOutput {
    fn from(_: ()) -> Self {
        WorkOutput::Empty
    }
}

impl From<String> for WorkOutput {
    fn from(s: String) -> Self {
        WorkOutput::Text(s)
    }
}

impl From<&str> for WorkOutput {
    fn from(s: &str) -> Self {
        WorkOutput::Text(s.to_string())
    }
}

impl From<JsonValue> for WorkOutput {
    fn from(v: JsonValue) -> Self {
        WorkOutput::Structured(v)
    }
}

/// The job a monitored command performs.
pub trait WorkUnit {
    fn run(&self, ctx: &RunContext) -> anyhow::Result<WorkOutput>;

    /// Source location reported with failures of this unit.
    fn location(&self) -> Option<&'static Location<'static>> {
        None
    }
}

/// Work unit backed by a closure; see `from_fn`.
pub struct FnWork<F> {
    f: F,
    defined_at: &'static Location<'static>,
}

/// Wrap a closure as a `WorkUnit`. Failures are reported at the caller's
/// file and line.
#[track_caller]
pub fn from_fn<F, T>(f: F) -> FnWork<F>
where
    F: Fn(&RunContext) -> anyhow::Result<T>,
    T: Into<WorkOutput>,
{
    FnWork {
        f,
        defined_at: Location::caller(),
    }
}

impl<F, T> WorkUnit for FnWork<F>
where
    F: Fn(&RunContext) -> anyhow::Result<T>,
    T: Into<WorkOutput>,
{
    fn run(&self, ctx: &RunContext) -> anyhow::Result<WorkOutput> {
        (self.f)(ctx).map(Into::into)
    }

    fn location(&self) -> Option<&'static Location<'static>> {
        Some(self.defined_at)
    }
}

/// Why an invocation was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Rejection {
    AlreadyRun,
    CurrentlyRunning,
    RunLimitExceeded { limit: i64, attempts: u64 },
    DependencyNotMet { name: String },
    ConflictingCommandRan { name: String },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::AlreadyRun => "already_run",
            Rejection::CurrentlyRunning => "currently_running",
            Rejection::RunLimitExceeded { .. } => "run_limit_exceeded",
            Rejection::DependencyNotMet { .. } => "dependency_not_met",
            Rejection::ConflictingCommandRan { .. } => "conflicting_command_ran",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AlreadyRun => write!(f, "Command has run before."),
            Rejection::CurrentlyRunning => write!(f, "Command is running."),
            Rejection::RunLimitExceeded { .. } => {
                write!(f, "Command has been run or requested too many times.")
            }
            Rejection::DependencyNotMet { name } => write!(f, "Command {} has not run yet.", name),
            Rejection::ConflictingCommandRan { name } => {
                write!(f, "Command {} has already run.", name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Work ran and the record was completed.
    Completed { record: CommandRecord },
    /// Nested work ran; the outer run will finalize the shared record.
    Deferred { record: CommandRecord },
    /// Admission refused; the record is withdrawn with the reason.
    Rejected {
        record: CommandRecord,
        rejection: Rejection,
    },
    /// Work returned an error or panicked; the record is withdrawn.
    Failed {
        record: CommandRecord,
        message: String,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed { .. } | Outcome::Deferred { .. })
    }

    pub fn record(&self) -> &CommandRecord {
        match self {
            Outcome::Completed { record }
            | Outcome::Deferred { record }
            | Outcome::Rejected { record, .. }
            | Outcome::Failed { record, .. } => record,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Completed { .. } => "completed",
            Outcome::Deferred { .. } => "deferred",
            Outcome::Rejected { .. } => "rejected",
            Outcome::Failed { .. } => "failed",
        }
    }

    /// Human-readable message: the result text or the rejection reason.
    pub fn message(&self) -> String {
        match self {
            Outcome::Completed { record } | Outcome::Deferred { record } => record.result.clone(),
            Outcome::Rejected { rejection, .. } => rejection.to_string(),
            Outcome::Failed { message, .. } => message.clone(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut out = serde_json::json!({
            "outcome": self.status(),
            "record_id": self.record().id,
            "message": self.message(),
            "record": self.record(),
        });
        if let Outcome::Rejected { rejection, .. } = self {
            out["rejection"] = serde_json::to_value(rejection).unwrap_or(JsonValue::Null);
        }
        out
    }
}

enum Claim {
    Admitted(CommandRecord),
    Rejected(CommandRecord, Rejection),
}

pub struct AdmissionController<S: RecordStore> {
    store: S,
}

impl<S: RecordStore> AdmissionController<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Admit, run and finalize one invocation of `definition`.
    ///
    /// Admission checks, record creation and `start` happen in one atomic
    /// store unit, so two concurrent invocations of a `runs_once` command
    /// cannot both pass. No store unit is held while `work` runs.
    pub fn execute<W>(
        &self,
        definition: &CommandDefinition,
        invocation: Invocation,
        work: &W,
    ) -> Result<Outcome, LedgerError>
    where
        W: WorkUnit + ?Sized,
    {
        let nested = matches!(invocation.attachment, Attachment::Nested(_));
        let claim = match invocation.attachment {
            Attachment::Nested(id) => Claim::Admitted(self.reattach(definition, id)?),
            Attachment::Fresh | Attachment::Resume(_) => self.claim(definition, &invocation)?,
        };

        let record = match claim {
            Claim::Admitted(record) => record,
            Claim::Rejected(record, rejection) => {
                return Ok(Outcome::Rejected { record, rejection });
            }
        };

        let ctx = if nested {
            RunContext::nested_in(&record, invocation)
        } else {
            RunContext::for_record(&record)
        };
        match panic::catch_unwind(AssertUnwindSafe(|| work.run(&ctx))) {
            Ok(Ok(_)) if nested => {
                let record = self.reload(record.id)?;
                // A deeper nested run already failed the shared record.
                if record.is_withdrawn() {
                    let message = record.result.clone();
                    return Ok(Outcome::Failed { record, message });
                }
                Ok(Outcome::Deferred { record })
            }
            Ok(Ok(output)) => self.finish(&record, &output.render()),
            Ok(Err(err)) => self.fail_run(&record, &describe_error(&err, work.location())),
            Err(payload) => self.fail_run(
                &record,
                &describe_panic(payload.as_ref(), work.location()),
            ),
        }
    }

    fn claim(
        &self,
        definition: &CommandDefinition,
        invocation: &Invocation,
    ) -> Result<Claim, LedgerError> {
        self.store.with_records("admission.claim", |r| {
            let existing = match invocation.attachment {
                Attachment::Resume(id) => {
                    let rec = find_required(r, id)?;
                    if rec.name != definition.name {
                        return Err(LedgerError::InvalidReentry(format!(
                            "record {} belongs to '{}', not '{}'",
                            id, rec.name, definition.name
                        )));
                    }
                    Some(rec)
                }
                _ => None,
            };

            if let Some(rejection) = check_admission(r, definition)? {
                let record = match existing {
                    Some(rec) => rec,
                    None => r.create(&definition.name, &invocation.arguments, &invocation.options)?,
                };
                let record = r.fail(&record, &rejection.to_string())?;
                return Ok(Claim::Rejected(record, rejection));
            }

            let record = match existing {
                Some(rec) if rec.has_started() => {
                    return Err(LedgerError::AlreadyStarted { id: rec.id });
                }
                Some(rec) => rec,
                None => r.create(&definition.name, &invocation.arguments, &invocation.options)?,
            };
            Ok(Claim::Admitted(r.start(&record)?))
        })
    }

    fn reattach(
        &self,
        definition: &CommandDefinition,
        id: RecordId,
    ) -> Result<CommandRecord, LedgerError> {
        if !definition.recursive {
            return Err(LedgerError::InvalidReentry(format!(
                "command '{}' is not recursive",
                definition.name
            )));
        }
        self.store.with_records("admission.reattach", |r| {
            let rec = find_required(r, id)?;
            if rec.name != definition.name {
                return Err(LedgerError::InvalidReentry(format!(
                    "record {} belongs to '{}', not '{}'",
                    id, rec.name, definition.name
                )));
            }
            if !rec.is_in_progress() {
                return Err(LedgerError::InvalidReentry(format!(
                    "record {} is {}, not running",
                    id,
                    rec.status()
                )));
            }
            Ok(rec)
        })
    }

    fn finish(&self, record: &CommandRecord, message: &str) -> Result<Outcome, LedgerError> {
        self.store.with_records("admission.complete", |r| {
            let current = find_required(r, record.id)?;
            // A nested run already failed the shared record.
            if current.is_withdrawn() {
                let message = current.result.clone();
                return Ok(Outcome::Failed {
                    record: current,
                    message,
                });
            }
            let record = r.complete(&current, message)?;
            Ok(Outcome::Completed { record })
        })
    }

    fn fail_run(&self, record: &CommandRecord, message: &str) -> Result<Outcome, LedgerError> {
        self.store.with_records("admission.fail", |r| {
            let current = find_required(r, record.id)?;
            if current.is_withdrawn() {
                let message = current.result.clone();
                return Ok(Outcome::Failed {
                    record: current,
                    message,
                });
            }
            let record = r.fail(&current, message)?;
            Ok(Outcome::Failed {
                record,
                message: message.to_string(),
            })
        })
    }

    fn reload(&self, id: RecordId) -> Result<CommandRecord, LedgerError> {
        self.store.with_records("admission.reload", |r| find_required(r, id))
    }
}

fn find_required(r: &dyn RecordOps, id: RecordId) -> Result<CommandRecord, LedgerError> {
    r.find_by_id(id)?
        .ok_or_else(|| LedgerError::NotFound(format!("command record {}", id)))
}

/// Checks in order; the first failing rule wins.
fn check_admission(
    r: &dyn RecordOps,
    definition: &CommandDefinition,
) -> Result<Option<Rejection>, LedgerError> {
    let name = definition.name.as_str();

    if definition.runs_once && r.has_completed(name)? {
        return Ok(Some(Rejection::AlreadyRun));
    }
    if definition.runs_once && r.is_in_progress(name)? {
        return Ok(Some(Rejection::CurrentlyRunning));
    }
    if definition.run_limit >= 0 {
        let attempts = r.requested_count(name)?.max(r.completed_count(name)?);
        if attempts >= definition.run_limit as u64 {
            return Ok(Some(Rejection::RunLimitExceeded {
                limit: definition.run_limit,
                attempts,
            }));
        }
    }
    for dep in &definition.runs_if {
        if !r.has_completed(dep)? {
            return Ok(Some(Rejection::DependencyNotMet { name: dep.clone() }));
        }
    }
    for other in &definition.doesnt_run_if {
        if r.has_completed(other)? {
            return Ok(Some(Rejection::ConflictingCommandRan {
                name: other.clone(),
            }));
        }
    }
    Ok(None)
}

/// `Error: <chain> at line N of FILE`, plus the stack trace when one was captured.
fn describe_error(err: &anyhow::Error, location: Option<&Location<'_>>) -> String {
    let mut message = format!("Error: {:#}", err);
    push_location(&mut message, location);
    let backtrace = err.backtrace();
    if backtrace.status() == BacktraceStatus::Captured {
        message.push_str(&format!(" Stack Trace: {}", backtrace));
    }
    message
}

fn describe_panic(payload: &(dyn Any + Send), location: Option<&Location<'_>>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    let mut message = format!("Error: work unit panicked: {}", detail);
    push_location(&mut message, location);
    message
}

fn push_location(message: &mut String, location: Option<&Location<'_>>) {
    if let Some(loc) = location {
        message.push_str(&format!(" at line {} of {}", loc.line(), loc.file()));
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "admission",
        "version": "0.1.0",
        "description": "Gate and track monitored command runs",
        "commands": [
            { "name": "run", "parameters": ["name", "record_id", "nested", "option", "args"] },
            { "name": "fail", "parameters": ["id", "message"] }
        ],
        "rejections": [
            "already_run",
            "currently_running",
            "run_limit_exceeded",
            "dependency_not_met",
            "conflicting_command_ran"
        ]
    })
}

//! The coordinator thread
//!
//! Requests are queued on a bounded channel and processed one at a time by
//! a single background thread. Each submitter gets a [`RequestHandle`]
//! carrying the reply channel for its report.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use relive_util::ids::RequestId;
use relive_util::IdGenerator;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::apply::{apply, finalize, ApplyOutcome};
use super::prepare::{mark_restricted, prepare, reset_update_states};
use super::request::UpdateRequest;
use super::unit::PreparedRequest;
use super::{ClassOutcome, ClassState, RequestState, UpdateReport};
use crate::config::{trace, MigrationMode};
use crate::error::{DiagnosticCode, Result, UpdateError};
use crate::logging::{log_event, UpdateEvent};
use crate::migration;
use crate::quiescence::check_threads;
use crate::runtime::Vm;
use crate::stats::PhaseTimer;

struct Job {
    request: UpdateRequest,
    reply: Sender<UpdateReport>,
}

/// Pending result of a submitted request
pub struct RequestHandle {
    id: RequestId,
    receiver: Receiver<UpdateReport>,
}

impl RequestHandle {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Block until the request reaches a terminal state
    pub fn wait(self) -> Result<UpdateReport> {
        self.receiver
            .recv()
            .map_err(|_| UpdateError::Internal(format!("coordinator stopped before {} finished", self.id)))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<UpdateReport> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => UpdateError::Timeout(format!("{} still running", self.id)),
            RecvTimeoutError::Disconnected => {
                UpdateError::Internal(format!("coordinator stopped before {} finished", self.id))
            },
        })
    }

    /// The report, if the request already finished
    pub fn try_result(&self) -> Option<UpdateReport> {
        self.receiver.try_recv().ok()
    }
}

/// Owner of the coordinator thread
pub struct Coordinator {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
    ids: IdGenerator,
    vm: Arc<Vm>,
}

impl Coordinator {
    pub fn start(vm: Arc<Vm>) -> Result<Self> {
        let (sender, receiver) = channel::bounded::<Job>(vm.config.queue_capacity);
        let worker_vm = Arc::clone(&vm);
        let worker = std::thread::Builder::new()
            .name("relive-coordinator".to_string())
            .spawn(move || run(worker_vm, receiver))
            .map_err(|e| UpdateError::Internal(format!("cannot spawn coordinator: {}", e)))?;
        Ok(Coordinator {
            sender: Some(sender),
            worker: Some(worker),
            ids: IdGenerator::new(),
            vm,
        })
    }

    /// Queue a request
    ///
    /// Fails with `ResourceExhausted` when the queue is full.
    pub fn submit(&self, mut request: UpdateRequest) -> Result<RequestHandle> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| UpdateError::invalid_state("running coordinator", "shut down"))?;
        request.id = self.ids.next();
        let id = request.id;
        let classes = request.class_count();
        let (reply, receiver) = channel::bounded(1);
        sender.try_send(Job { request, reply }).map_err(|e| match e {
            TrySendError::Full(_) => UpdateError::ResourceExhausted {
                resource: "update queue".to_string(),
            },
            TrySendError::Disconnected(_) => UpdateError::invalid_state("running coordinator", "stopped"),
        })?;
        self.vm.stats.record_submitted();
        log_event(UpdateEvent::RequestSubmitted {
            request: id.as_u64(),
            classes,
        });
        Ok(RequestHandle { id, receiver })
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Stop accepting requests, finish queued ones and join the thread
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("coordinator thread panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(vm: Arc<Vm>, jobs: Receiver<Job>) {
    log::debug!("coordinator started");
    for job in jobs.iter() {
        let id = job.request.id.as_u64();
        let report = match catch_unwind(AssertUnwindSafe(|| process(&vm, &job.request))) {
            Ok(report) => report,
            Err(_) => {
                vm.quiescence.finish();
                vm.stats.record_failed();
                let err = UpdateError::Internal("update panicked".to_string());
                log::error!("request {} panicked", id);
                UpdateReport::failed(id, RequestState::Failed, &err, vm.revision())
            },
        };
        // the submitter may have dropped its handle
        let _ = job.reply.send(report);
    }
    log::debug!("coordinator stopped");
}

/// Drive one request to a terminal state
fn process(vm: &Vm, request: &UpdateRequest) -> UpdateReport {
    let timer = PhaseTimer::new();
    let id = request.id.as_u64();

    let prepared = {
        let mut registry = vm.registry.write();
        prepare(vm, &mut registry, request)
    };
    let prepared = match prepared {
        Ok(p) => p,
        Err(e) => return early_exit(vm, id, e, &timer),
    };

    vm.quiescence.begin();
    let result = attempt_until_applied(vm, request, prepared);
    vm.quiescence.finish();

    let report = match result {
        Ok((mut prepared, outcome, attempts)) => {
            finalize(&mut vm.registry.write(), &prepared);
            applied_report(id, &mut prepared, &outcome, attempts, &timer)
        },
        Err((e, attempts)) => {
            let state = match e {
                UpdateError::Discarded => RequestState::Discarded,
                _ => RequestState::Failed,
            };
            let mut report = UpdateReport::failed(id, state, &e, vm.revision());
            report.attempts = attempts;
            report.duration_ms = timer.elapsed_ms();
            report
        },
    };

    match report.state {
        RequestState::Finished => vm.stats.record_finished(),
        RequestState::Discarded => vm.stats.record_discarded(),
        _ => vm.stats.record_failed(),
    }
    log_event(UpdateEvent::RequestFinished {
        request: id,
        state: report.state.to_string(),
        code: report.code.to_string(),
        duration_ms: report.duration_ms,
    });
    report
}

/// Report for a request that ended before its first pause
fn early_exit(vm: &Vm, id: u64, err: UpdateError, timer: &PhaseTimer) -> UpdateReport {
    let state = match err {
        UpdateError::EmptyRequest => RequestState::Empty,
        UpdateError::Discarded => RequestState::Discarded,
        _ => RequestState::Failed,
    };
    match state {
        RequestState::Failed => vm.stats.record_failed(),
        _ => vm.stats.record_discarded(),
    }
    let mut report = UpdateReport::failed(id, state, &err, vm.revision());
    report.duration_ms = timer.elapsed_ms();
    if state != RequestState::Failed {
        // nothing went wrong, nothing happened
        report.error = None;
    }
    log_event(UpdateEvent::RequestFinished {
        request: id,
        state: state.to_string(),
        code: report.code.to_string(),
        duration_ms: report.duration_ms,
    });
    report
}

type Applied = (PreparedRequest, ApplyOutcome, u32);

/// Pause, check and retry until the request applies or gives up
fn attempt_until_applied(
    vm: &Vm,
    request: &UpdateRequest,
    mut prepared: PreparedRequest,
) -> std::result::Result<Applied, (UpdateError, u32)> {
    let deadline = vm.config.request_timeout().map(|t| Instant::now() + t);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        log_event(UpdateEvent::PauseAttempt {
            request: request.id.as_u64(),
            attempt: attempts,
        });

        let pause = vm.safepoint.begin_pause(&vm.threads);
        let mut registry = vm.registry.write();

        let found = registry.modification_count();
        if found != prepared.modification_count {
            vm.stats.record_system_modified();
            log::info!(
                "{}: registry modified since prepare ({} -> {}), preparing again",
                request.id,
                prepared.modification_count,
                found
            );
            mark_restricted(&mut registry, &prepared.restricted_methods(), false);
            reset_update_states(&mut registry, &prepared);
            drop(registry);
            drop(pause);
            vm.quiescence.settle();
            let again = prepare(vm, &mut vm.registry.write(), request);
            match again {
                Ok(p) => prepared = p,
                Err(e) => return Err((e, attempts)),
            }
            if out_of_attempts(vm, attempts) {
                let e = UpdateError::SystemModified {
                    expected: prepared.modification_count,
                    found,
                };
                return Err((abandon(vm, &prepared, e), attempts));
            }
            continue;
        }

        let check = check_threads(vm, &registry);
        if check.is_safe() {
            let outcome = apply(vm, &mut registry, &mut prepared, &request.hints);
            drop(registry);
            if vm.config.migration_mode == MigrationMode::Eager {
                let sweep = migration::sweep(vm, outcome.to_rn);
                log::debug!("eager sweep migrated {} of {} objects", sweep.migrated, sweep.scanned);
            }
            end_pause(vm, "apply", pause.elapsed());
            drop(pause);
            return Ok((prepared, outcome, attempts));
        }

        vm.stats.record_interrupted();
        log_event(UpdateEvent::RequestInterrupted {
            request: request.id.as_u64(),
            unsafe_threads: check.unsafe_threads.len(),
        });
        vm.quiescence.arm(check.barriers);
        drop(registry);
        end_pause(vm, "check", pause.elapsed());
        drop(pause);
        vm.quiescence.settle();

        if out_of_attempts(vm, attempts) {
            let e = UpdateError::QuiescenceRetry {
                unsafe_threads: check.unsafe_threads.len(),
            };
            return Err((abandon(vm, &prepared, e), attempts));
        }
        let wait = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    let e = UpdateError::Timeout(format!(
                        "{} threads still in restricted code",
                        check.unsafe_threads.len()
                    ));
                    return Err((abandon(vm, &prepared, e), attempts));
                }
                vm.config.barrier_retry_interval().min(d - now)
            },
            None => vm.config.barrier_retry_interval(),
        };
        let woken = vm.quiescence.wait_for_wake(wait);
        if vm.config.traces(trace::THREADS) {
            log::debug!(
                "{}: retrying ({}), {} barriers outstanding",
                request.id,
                if woken { "barrier" } else { "interval" },
                vm.quiescence.outstanding()
            );
        }
    }
}

/// Whether the attempt budget is spent; zero means unbounded
fn out_of_attempts(vm: &Vm, attempts: u32) -> bool {
    vm.config.max_retries > 0 && attempts >= vm.config.max_retries
}

fn end_pause(vm: &Vm, phase: &str, elapsed: Duration) {
    vm.stats.record_pause(elapsed);
    if vm.config.traces(trace::TIMER) {
        log_event(UpdateEvent::Pause {
            phase: phase.to_string(),
            duration_us: elapsed.as_micros() as u64,
        });
    }
}

/// Give up on a prepared request, clearing what prepare marked
fn abandon(vm: &Vm, prepared: &PreparedRequest, err: UpdateError) -> UpdateError {
    let mut registry = vm.registry.write();
    mark_restricted(&mut registry, &prepared.restricted_methods(), false);
    reset_update_states(&mut registry, prepared);
    log::warn!("update abandoned: {}", err);
    err
}

fn applied_report(
    id: u64,
    prepared: &mut PreparedRequest,
    outcome: &ApplyOutcome,
    attempts: u32,
    timer: &PhaseTimer,
) -> UpdateReport {
    let mut classes: Vec<ClassOutcome> = prepared
        .units
        .iter_mut()
        .map(|u| ClassOutcome {
            name: u.name.to_string(),
            updating_type: u.updating_type.to_string(),
            state: u.state,
            error: u.error.take().map(|e| e.to_string()),
        })
        .collect();
    classes.extend(outcome.relinked.iter().map(|name| ClassOutcome {
        name: name.to_string(),
        updating_type: "RELINK".to_string(),
        state: ClassState::Relinked,
        error: None,
    }));

    let failed: Vec<&ClassOutcome> = classes.iter().filter(|c| c.state == ClassState::Failed).collect();
    let (state, code, error) = match failed.first() {
        None => (RequestState::Finished, DiagnosticCode::OK, None),
        Some(first) => {
            let e = UpdateError::PartialApplication {
                failed: failed.len(),
                total: prepared.changed(),
                first: format!("{}: {}", first.name, first.error.as_deref().unwrap_or("unknown")),
            };
            (RequestState::Failed, e.code(), Some(e.to_string()))
        },
    };
    UpdateReport {
        request: id,
        state,
        code,
        classes,
        from_rn: prepared.from_rn,
        to_rn: outcome.to_rn,
        attempts,
        duration_ms: timer.elapsed_ms(),
        error,
    }
}

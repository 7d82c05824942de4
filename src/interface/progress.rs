use std::collections::VecDeque;
use std::time::Instant;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::solvers::{CalcEvent, ItemSummary};

const LOG_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Idle,
    Running,
    Finished,
}

/// Console-side view of a batch, fed from the executor's event channel.
#[derive(Debug)]
pub struct RunProgress {
    pub status: RunStatus,
    pub total: usize,
    pub started: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successful items that hit a step budget somewhere.
    pub unconverged: usize,
    pub finished: Vec<ItemSummary>,
    pub logs: VecDeque<String>,
    start_time: Instant,
}

impl RunProgress {
    pub fn new(total: usize) -> Self {
        Self {
            status: RunStatus::Idle,
            total,
            started: 0,
            succeeded: 0,
            failed: 0,
            unconverged: 0,
            finished: Vec::with_capacity(total),
            logs: VecDeque::with_capacity(LOG_CAPACITY),
            start_time: Instant::now(),
        }
    }

    pub fn done(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Updates the counters and returns a one-line description for the console.
    pub fn ingest(&mut self, event: CalcEvent) -> Option<String> {
        let line = match event {
            CalcEvent::Log(msg) => msg,
            CalcEvent::ItemStarted { index, label } => {
                self.status = RunStatus::Running;
                self.started += 1;
                return self.note(format!("[{}] started {}", index, label), false);
            }
            CalcEvent::ItemFinished(summary) => {
                if summary.success {
                    self.succeeded += 1;
                    if !summary.converged {
                        self.unconverged += 1;
                    }
                } else {
                    self.failed += 1;
                }
                let state = match (summary.success, summary.converged) {
                    (false, _) => "FAILED",
                    (true, false) => "done (not converged)",
                    (true, true) => "done",
                };
                let mut line = format!(
                    "[{}/{}] {} {} in {:.2} s",
                    self.done(),
                    self.total,
                    summary.label,
                    state,
                    summary.elapsed_secs
                );
                if let Some(msg) = &summary.message {
                    line.push_str(": ");
                    line.push_str(msg);
                }
                self.finished.push(summary);
                line
            }
            CalcEvent::Finished {
                succeeded,
                failed,
                elapsed_secs,
            } => {
                self.status = RunStatus::Finished;
                format!(
                    "Finished: {} succeeded, {} failed ({} not converged) in {:.2} s",
                    succeeded, failed, self.unconverged, elapsed_secs
                )
            }
        };
        self.note(line, true)
    }

    /// Handles every event already queued on `rx` without blocking.
    pub fn drain(&mut self, rx: &Receiver<CalcEvent>) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => lines.extend(self.ingest(event)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.status = RunStatus::Finished;
                    break;
                }
            }
        }
        lines
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    fn note(&mut self, line: String, show: bool) -> Option<String> {
        if self.logs.len() >= LOG_CAPACITY {
            self.logs.pop_front();
        }
        self.logs.push_back(line.clone());
        show.then_some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn summary(index: usize, success: bool, converged: bool) -> ItemSummary {
        ItemSummary {
            index,
            label: format!("s{}", index),
            success,
            converged,
            elapsed_secs: 0.5,
            message: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn counts_outcomes_from_the_channel() {
        let (tx, rx) = unbounded();
        tx.send(CalcEvent::ItemStarted { index: 0, label: "s0".into() }).unwrap();
        tx.send(CalcEvent::ItemFinished(summary(0, true, true))).unwrap();
        tx.send(CalcEvent::ItemFinished(summary(1, false, false))).unwrap();
        tx.send(CalcEvent::ItemFinished(summary(2, true, false))).unwrap();
        tx.send(CalcEvent::Finished { succeeded: 2, failed: 1, elapsed_secs: 1.0 }).unwrap();
        drop(tx);

        let mut progress = RunProgress::new(3);
        let lines = progress.drain(&rx);
        assert_eq!(progress.status, RunStatus::Finished);
        assert_eq!((progress.succeeded, progress.failed, progress.unconverged), (2, 1, 1));
        assert_eq!(progress.started, 1);
        assert_eq!(lines.len(), 4);
        assert!(lines[1].contains("FAILED: boom"));
        assert!(lines[3].contains("1 not converged"));
        assert_eq!(progress.logs.len(), 5);
    }

    #[test]
    fn log_buffer_is_bounded() {
        let mut progress = RunProgress::new(0);
        for i in 0..(LOG_CAPACITY + 10) {
            progress.ingest(CalcEvent::Log(format!("line {}", i)));
        }
        assert_eq!(progress.logs.len(), LOG_CAPACITY);
        assert_eq!(progress.logs.front().unwrap(), "line 10");
    }
}

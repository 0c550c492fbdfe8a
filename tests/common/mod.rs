//! Shared test fixtures: a scripted stub engine and a recording observer.
#![allow(dead_code)] // not every test binary uses every fixture

use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use perfbridge::{Engine, EngineError, EngineHandle, StopSwitch, TestObserver};

/// Behavior of one scripted engine run.
#[derive(Debug, Clone)]
pub enum Script {
    /// Write the lines, then return success.
    Lines(Vec<&'static str>),
    /// Write the lines, then return a failure with the given message.
    LinesThenFail(Vec<&'static str>, &'static str),
    /// Reject the argument vector at parse time.
    RejectArgs,
    /// Write the lines, then spin until the stop flag is set, then succeed.
    BlockUntilStop(Vec<&'static str>),
    /// Write the lines, spin until stopped, then return a failure -- models
    /// an engine whose interrupted wait surfaces as an error status.
    BlockThenFail(Vec<&'static str>, &'static str),
    /// Handle construction fails.
    FailCreate,
}

pub struct ScriptedEngine {
    pub script: Script,
}

impl Engine for ScriptedEngine {
    fn create(&self) -> Option<Box<dyn EngineHandle>> {
        if matches!(self.script, Script::FailCreate) {
            return None;
        }
        Some(Box::new(ScriptedHandle {
            script: self.script.clone(),
            sink: None,
            stop: StopSwitch::default(),
        }))
    }
}

struct ScriptedHandle {
    script: Script,
    sink: Option<Box<dyn Write + Send>>,
    stop: StopSwitch,
}

impl ScriptedHandle {
    fn write_lines(&mut self, lines: &[&'static str]) -> Result<(), EngineError> {
        if let Some(sink) = self.sink.as_mut() {
            for line in lines {
                writeln!(sink, "{line}")?;
            }
            sink.flush()?;
        }
        Ok(())
    }

    fn spin_until_stopped(&self) {
        while !self.stop.is_stopped() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl EngineHandle for ScriptedHandle {
    fn apply_defaults(&mut self) {}

    fn parse_arguments(&mut self, argv: &[String]) -> Result<(), EngineError> {
        if matches!(self.script, Script::RejectArgs) {
            let offender = argv.get(1).cloned().unwrap_or_default();
            return Err(EngineError::UnknownArgument(offender));
        }
        Ok(())
    }

    fn attach_output(&mut self, sink: Box<dyn Write + Send>) {
        self.sink = Some(sink);
    }

    fn stop_switch(&self) -> StopSwitch {
        self.stop.clone()
    }

    fn run(&mut self) -> Result<(), EngineError> {
        match self.script.clone() {
            Script::Lines(lines) => self.write_lines(&lines),
            Script::LinesThenFail(lines, message) => {
                self.write_lines(&lines)?;
                Err(EngineError::Worker(message.to_owned()))
            }
            Script::BlockUntilStop(lines) => {
                self.write_lines(&lines)?;
                self.spin_until_stopped();
                Ok(())
            }
            Script::BlockThenFail(lines, message) => {
                self.write_lines(&lines)?;
                self.spin_until_stopped();
                Err(EngineError::Worker(message.to_owned()))
            }
            Script::RejectArgs | Script::FailCreate => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Output(String),
    Error(String),
    Complete,
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
    done: tokio::sync::Notify,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Output lines only, excluding the bridge's synthetic status lines.
    pub fn engine_lines(&self) -> Vec<String> {
        use perfbridge::bridge::{
            STATUS_COMPLETED, STATUS_FAILED, STATUS_STARTING, STATUS_STOPPED,
            STATUS_STOP_REQUESTED,
        };
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Output(line) => Some(line),
                _ => None,
            })
            .filter(|line| {
                line != STATUS_STARTING
                    && line != STATUS_STOP_REQUESTED
                    && line != STATUS_STOPPED
                    && line != STATUS_FAILED
                    && line != STATUS_COMPLETED
            })
            .collect()
    }

    pub async fn wait_complete(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.done.notified())
            .await
            .expect("timed out waiting for on_complete");
    }
}

#[async_trait]
impl TestObserver for RecordingObserver {
    async fn on_output(&self, line: &str) {
        self.events.lock().unwrap().push(Event::Output(line.to_owned()));
    }

    async fn on_error(&self, message: &str) {
        self.events.lock().unwrap().push(Event::Error(message.to_owned()));
    }

    async fn on_complete(&self) {
        self.events.lock().unwrap().push(Event::Complete);
        self.done.notify_one();
    }
}

/// Wait until some output line containing `needle` has been recorded.
pub async fn wait_for_output(observer: &RecordingObserver, needle: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let seen = observer
                .events()
                .iter()
                .any(|e| matches!(e, Event::Output(line) if line.contains(needle)));
            if seen {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for output line");
}

pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_owned()).collect()
}

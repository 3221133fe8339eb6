//! Scripted process host used by unit tests across the crate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ProcessExit, ProcessHost, ProcessKiller, ProcessRequest, RunningProcess};
use crate::cancel::CancelToken;

/// What the next spawn does.
#[derive(Debug, Clone)]
pub enum Script {
    /// `spawn` itself fails.
    SpawnError,
    /// Exits with `code` after `after`, printing `stdout`.
    Exit {
        code: i32,
        stdout: String,
        after: Duration,
    },
    /// Runs until killed.
    Hang,
}

impl Script {
    pub fn ok(stdout: &str) -> Self {
        Script::Exit {
            code: 0,
            stdout: stdout.to_string(),
            after: Duration::ZERO,
        }
    }

    pub fn exit(code: i32) -> Self {
        Script::Exit {
            code,
            stdout: String::new(),
            after: Duration::ZERO,
        }
    }
}

/// Replays scripts in order; once the queue is empty every spawn uses the
/// fallback script.
#[derive(Debug, Clone)]
pub struct ScriptedHost {
    queue: Arc<Mutex<VecDeque<Script>>>,
    fallback: Script,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    killers: Arc<Mutex<Vec<ProcessKiller>>>,
}

impl ScriptedHost {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self::with_fallback(scripts, Script::ok(""))
    }

    pub fn with_fallback(scripts: impl IntoIterator<Item = Script>, fallback: Script) -> Self {
        Self {
            queue: Arc::new(Mutex::new(scripts.into_iter().collect())),
            fallback,
            spawned: Arc::default(),
            killers: Arc::default(),
        }
    }

    /// Requests that reached `spawn`, including failed ones.
    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.spawned().iter().map(ProcessRequest::full_command).collect()
    }

    pub fn killed_count(&self) -> usize {
        self.killers
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.is_killed())
            .count()
    }
}

impl ProcessHost for ScriptedHost {
    fn spawn(&self, request: &ProcessRequest) -> std::io::Result<Box<dyn RunningProcess>> {
        self.spawned.lock().unwrap().push(request.clone());
        let script = self
            .queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        if let Script::SpawnError = script {
            return Err(std::io::Error::other("resource temporarily unavailable"));
        }

        let (killer, kill_requested) = ProcessKiller::new();
        self.killers.lock().unwrap().push(killer.clone());
        Ok(Box::new(FakeProcess {
            script,
            killer,
            kill_requested,
        }))
    }
}

struct FakeProcess {
    script: Script,
    killer: ProcessKiller,
    kill_requested: CancelToken,
}

#[async_trait]
impl RunningProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn killer(&self) -> ProcessKiller {
        self.killer.clone()
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let killed = ProcessExit {
            code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        match &self.script {
            Script::Exit {
                code,
                stdout,
                after,
            } => {
                tokio::select! {
                    _ = tokio::time::sleep(*after) => Ok(ProcessExit {
                        code: Some(*code),
                        stdout: stdout.clone(),
                        stderr: String::new(),
                    }),
                    _ = self.kill_requested.cancelled() => Ok(killed),
                }
            }
            Script::Hang => {
                self.kill_requested.cancelled().await;
                Ok(killed)
            }
            Script::SpawnError => unreachable!("spawn errors never produce a process"),
        }
    }
}

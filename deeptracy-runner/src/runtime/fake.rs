//! In-memory container runtime for tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{ContainerRuntime, ExecOutput, ExecRequest, RuntimeError};

type Handler = Box<dyn Fn(&str, &ExecRequest) -> ExecOutput + Send + Sync>;

#[derive(Default)]
struct FakeState {
    /// container id -> image
    containers: HashMap<String, String>,
    missing: HashSet<String>,
    broken: HashSet<String>,
    stalled: HashSet<String>,
    pulls: Vec<String>,
    started: usize,
    removed: usize,
    execs: Vec<(String, Vec<String>)>,
}

/// Records container operations and answers exec calls through a handler
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    handler: Handler,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::with_handler(|_, _| ExecOutput::default())
    }

    /// Answers every exec with `handler(image, request)`
    pub fn with_handler(
        handler: impl Fn(&str, &ExecRequest) -> ExecOutput + Send + Sync + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            handler: Box::new(handler),
        }
    }

    /// Marks an image as absent locally
    pub fn missing(self, image: &str) -> Self {
        self.state.lock().unwrap().missing.insert(image.to_string());
        self
    }

    /// Makes every start of `image` fail
    pub fn broken(self, image: &str) -> Self {
        self.state.lock().unwrap().broken.insert(image.to_string());
        self
    }

    /// Makes every exec in `image` hang until its caller gives up
    pub fn stalled(self, image: &str) -> Self {
        self.state.lock().unwrap().stalled.insert(image.to_string());
        self
    }

    pub fn started(&self) -> usize {
        self.state.lock().unwrap().started
    }

    pub fn removed(&self) -> usize {
        self.state.lock().unwrap().removed
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn running(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    /// Image and argv of every exec, in call order
    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().execs.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(!self.state.lock().unwrap().missing.contains(image))
    }

    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.pulls.push(image.to_string());
        state.missing.remove(image);
        Ok(())
    }

    async fn start(&self, name: &str, image: &str) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.broken.contains(image) {
            return Err(RuntimeError::Command {
                command: "start".to_string(),
                exit_code: 125,
                stderr: format!("cannot start {}", image),
            });
        }
        state.started += 1;
        let id = format!("{}-{}", name, state.started);
        state.containers.insert(id.clone(), image.to_string());
        Ok(id)
    }

    async fn exec(
        &self,
        container: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, RuntimeError> {
        let (image, stalled) = {
            let mut state = self.state.lock().unwrap();
            let image = state
                .containers
                .get(container)
                .cloned()
                .ok_or_else(|| RuntimeError::Command {
                    command: "exec".to_string(),
                    exit_code: 125,
                    stderr: format!("no such container {}", container),
                })?;
            state.execs.push((image.clone(), request.argv.clone()));
            let stalled = state.stalled.contains(&image);
            (image, stalled)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok((self.handler)(&image, request))
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.containers.remove(container).is_some() {
            state.removed += 1;
        }
        Ok(())
    }
}

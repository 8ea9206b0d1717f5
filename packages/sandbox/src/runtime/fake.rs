// ABOUTME: Scriptable in-memory runtime used by unit tests
// ABOUTME: Records every call and lets tests inject failures, canned exec output and pauses

use super::{
    InstanceSpec, InstanceState, InstanceSummary, RawExecOutput, Result, Runtime, RuntimeError,
    SANDBOX_ID_LABEL,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
struct FakeInstance {
    name: String,
    state: InstanceState,
    address: Option<String>,
    sandbox_id: Option<i64>,
}

#[derive(Default)]
struct FakeState {
    instances: HashMap<String, FakeInstance>,
    next_id: u64,
    next_address: u8,
    calls: Vec<String>,
    failing: HashSet<&'static str>,
    responses: Vec<(String, RawExecOutput)>,
    files: HashMap<(String, String), Vec<u8>>,
    gate: Option<(String, Arc<Semaphore>)>,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of `operation` fail with a transport error
    pub(crate) fn fail(&self, operation: &'static str) {
        self.lock().failing.insert(operation);
    }

    pub(crate) fn recover(&self, operation: &'static str) {
        self.lock().failing.remove(operation);
    }

    /// Answer commands whose joined argv starts with `prefix` with `output`
    pub(crate) fn respond(&self, prefix: &str, exit_code: i64, stdout: &str, stderr: &str) {
        self.lock().responses.push((
            prefix.to_string(),
            RawExecOutput {
                exit_code,
                stdout: stdout.as_bytes().to_vec(),
                stderr: stderr.as_bytes().to_vec(),
            },
        ));
    }

    pub(crate) fn clear_responses(&self) {
        self.lock().responses.clear();
    }

    /// Hold commands matching `prefix` until the returned semaphore gets a permit
    pub(crate) fn gate(&self, prefix: &str) -> Arc<Semaphore> {
        let semaphore = Arc::new(Semaphore::new(0));
        self.lock().gate = Some((prefix.to_string(), semaphore.clone()));
        semaphore
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub(crate) fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    pub(crate) fn exec_calls(&self) -> Vec<String> {
        self.calls_starting_with("exec ")
            .into_iter()
            .map(|call| call.trim_start_matches("exec ").to_string())
            .collect()
    }

    pub(crate) fn instance_state(&self, runtime_id: &str) -> Option<InstanceState> {
        self.lock().instances.get(runtime_id).map(|i| i.state)
    }

    pub(crate) fn set_state(&self, runtime_id: &str, state: InstanceState) {
        if let Some(instance) = self.lock().instances.get_mut(runtime_id) {
            instance.state = state;
        }
    }

    /// Register an instance the panel has no record of
    pub(crate) fn insert_stray(&self, runtime_id: &str, name: &str, sandbox_id: Option<i64>) {
        self.lock().instances.insert(
            runtime_id.to_string(),
            FakeInstance {
                name: name.to_string(),
                state: InstanceState::Running,
                address: None,
                sandbox_id,
            },
        );
    }

    pub(crate) fn file(&self, runtime_id: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(&(runtime_id.to_string(), path.to_string()))
            .cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn record(&self, operation: &'static str, detail: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("{} {}", operation, detail));
        if state.failing.contains(operation) {
            return Err(RuntimeError::Transport(format!("injected {} failure", operation)));
        }
        Ok(())
    }

    fn with_instance<T>(
        &self,
        runtime_id: &str,
        f: impl FnOnce(&mut FakeInstance, &mut u8) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        let FakeState {
            instances,
            next_address,
            ..
        } = &mut *state;
        let instance = instances
            .get_mut(runtime_id)
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))?;
        Ok(f(instance, next_address))
    }
}

fn assign_address(instance: &mut FakeInstance, next_address: &mut u8) {
    *next_address = next_address.wrapping_add(1).max(2);
    instance.address = Some(format!("172.17.0.{}", next_address));
    instance.state = InstanceState::Running;
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        self.record("ping", "")
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String> {
        self.record("create", &spec.name)?;

        let mut state = self.lock();
        if state.instances.values().any(|i| i.name == spec.name) {
            return Err(RuntimeError::Conflict(spec.name.clone()));
        }
        state.next_id += 1;
        let runtime_id = format!("rt{}", state.next_id);
        let mut instance = FakeInstance {
            name: spec.name.clone(),
            state: InstanceState::Created,
            address: None,
            sandbox_id: spec
                .labels
                .get(SANDBOX_ID_LABEL)
                .and_then(|id| id.parse().ok()),
        };
        assign_address(&mut instance, &mut state.next_address);
        state.instances.insert(runtime_id.clone(), instance);
        Ok(runtime_id)
    }

    async fn start(&self, runtime_id: &str) -> Result<()> {
        self.record("start", runtime_id)?;
        self.with_instance(runtime_id, assign_address)
    }

    async fn stop(&self, runtime_id: &str) -> Result<()> {
        self.record("stop", runtime_id)?;
        self.with_instance(runtime_id, |instance, _| {
            instance.state = InstanceState::Exited;
            instance.address = None;
        })
    }

    async fn restart(&self, runtime_id: &str) -> Result<()> {
        self.record("restart", runtime_id)?;
        self.with_instance(runtime_id, assign_address)
    }

    async fn remove(&self, runtime_id: &str, _force: bool) -> Result<()> {
        self.record("remove", runtime_id)?;
        self.lock()
            .instances
            .remove(runtime_id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(runtime_id.to_string()))
    }

    async fn state(&self, runtime_id: &str) -> Result<InstanceState> {
        self.record("state", runtime_id)?;
        self.with_instance(runtime_id, |instance, _| instance.state)
    }

    async fn address(&self, runtime_id: &str) -> Result<Option<String>> {
        self.record("address", runtime_id)?;
        self.with_instance(runtime_id, |instance, _| instance.address.clone())
    }

    async fn copy_in(&self, runtime_id: &str, contents: &[u8], remote_path: &str) -> Result<()> {
        self.record("copy_in", &format!("{} {}", runtime_id, remote_path))?;
        self.with_instance(runtime_id, |_, _| ())?;
        self.lock().files.insert(
            (runtime_id.to_string(), remote_path.to_string()),
            contents.to_vec(),
        );
        Ok(())
    }

    async fn copy_out(&self, runtime_id: &str, remote_path: &str) -> Result<Vec<u8>> {
        self.record("copy_out", &format!("{} {}", runtime_id, remote_path))?;
        self.with_instance(runtime_id, |_, _| ())?;
        self.file(runtime_id, remote_path)
            .ok_or_else(|| RuntimeError::NotFound(remote_path.to_string()))
    }

    async fn exec(&self, runtime_id: &str, argv: &[String], _tty: bool) -> Result<RawExecOutput> {
        let command = argv.join(" ");
        self.record("exec", &command)?;

        let running = self.with_instance(runtime_id, |instance, _| instance.state.is_live())?;
        if !running {
            return Err(RuntimeError::Conflict(format!(
                "container {} is not running",
                runtime_id
            )));
        }

        let gate = self.lock().gate.clone();
        if let Some((prefix, semaphore)) = gate {
            if command.starts_with(&prefix) {
                let permit = semaphore.acquire().await;
                drop(permit);
            }
        }

        let state = self.lock();
        Ok(state
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn list_managed(&self) -> Result<Vec<InstanceSummary>> {
        self.record("list_managed", "")?;
        Ok(self
            .lock()
            .instances
            .iter()
            .map(|(runtime_id, instance)| InstanceSummary {
                runtime_id: runtime_id.clone(),
                name: instance.name.clone(),
                state: instance.state,
                sandbox_id: instance.sandbox_id,
            })
            .collect())
    }
}

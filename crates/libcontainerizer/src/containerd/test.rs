//! In-memory `DaemonClient` that records every call for assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{Receiver, Sender};

use super::client::{ClientError, ClientResult, ContainerRecord, DaemonClient, TaskInfo, TaskIo};
use crate::container_manager::{ContainerStatus, Event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateContainerArgs {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub spec: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTaskArgs {
    pub id: String,
    pub io: TaskIo,
    pub io_uid: u32,
    pub io_gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecArgs {
    pub id: String,
    pub exec_id: String,
    pub process: Vec<u8>,
    pub io: TaskIo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillArgs {
    pub id: String,
    pub exec_id: String,
    pub signal: u32,
    pub all: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitArgs {
    pub id: String,
    pub exec_id: String,
    pub timeout: Option<Duration>,
}

type ProcessKey = (String, String);

#[derive(Default)]
pub struct TestHelperClient {
    containers: Mutex<HashMap<String, ContainerRecord>>,
    tasks: Mutex<HashMap<ProcessKey, VecDeque<TaskInfo>>>,
    exit_codes: Mutex<HashMap<ProcessKey, u32>>,
    metrics: Mutex<HashMap<String, prost_types::Any>>,
    failures: Mutex<HashMap<&'static str, VecDeque<ClientError>>>,
    oom_subscribers: Mutex<Vec<Sender<Event>>>,
    closed: AtomicBool,

    create_container_args: Mutex<Vec<CreateContainerArgs>>,
    create_task_args: Mutex<Vec<CreateTaskArgs>>,
    start_args: Mutex<Vec<ProcessKey>>,
    exec_args: Mutex<Vec<ExecArgs>>,
    kill_args: Mutex<Vec<KillArgs>>,
    wait_args: Mutex<Vec<WaitArgs>>,
    delete_task_args: Mutex<Vec<String>>,
    delete_process_args: Mutex<Vec<ProcessKey>>,
    delete_container_args: Mutex<Vec<String>>,
    list_filters: Mutex<Vec<String>>,
}

fn key(id: &str, exec_id: &str) -> ProcessKey {
    (id.to_owned(), exec_id.to_owned())
}

impl TestHelperClient {
    /// Queues an error returned by the next call to `method`.
    pub fn fail_next(&self, method: &'static str, err: ClientError) {
        self.failures
            .lock()
            .unwrap()
            .entry(method)
            .or_default()
            .push_back(err);
    }

    fn check(&self, method: &'static str) -> ClientResult<()> {
        match self
            .failures
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn set_container(&self, id: &str, record: ContainerRecord) {
        self.containers
            .lock()
            .unwrap()
            .insert(id.to_owned(), record);
    }

    /// Queues a task answer. The last queued answer is repeated forever.
    pub fn push_task(&self, id: &str, exec_id: &str, info: TaskInfo) {
        self.tasks
            .lock()
            .unwrap()
            .entry(key(id, exec_id))
            .or_default()
            .push_back(info);
    }

    pub fn set_exit_code(&self, id: &str, exec_id: &str, code: u32) {
        self.exit_codes
            .lock()
            .unwrap()
            .insert(key(id, exec_id), code);
    }

    pub fn set_metrics(&self, id: &str, metrics: prost_types::Any) {
        self.metrics.lock().unwrap().insert(id.to_owned(), metrics);
    }

    pub fn publish_oom(&self, container_id: &str) {
        self.oom_subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(Event::oom(container_id)).is_ok());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn get_create_container_args(&self) -> Vec<CreateContainerArgs> {
        self.create_container_args.lock().unwrap().clone()
    }

    pub fn get_create_task_args(&self) -> Vec<CreateTaskArgs> {
        self.create_task_args.lock().unwrap().clone()
    }

    pub fn get_start_args(&self) -> Vec<ProcessKey> {
        self.start_args.lock().unwrap().clone()
    }

    pub fn get_exec_args(&self) -> Vec<ExecArgs> {
        self.exec_args.lock().unwrap().clone()
    }

    pub fn get_kill_args(&self) -> Vec<KillArgs> {
        self.kill_args.lock().unwrap().clone()
    }

    pub fn get_wait_args(&self) -> Vec<WaitArgs> {
        self.wait_args.lock().unwrap().clone()
    }

    pub fn get_delete_task_args(&self) -> Vec<String> {
        self.delete_task_args.lock().unwrap().clone()
    }

    pub fn get_delete_process_args(&self) -> Vec<ProcessKey> {
        self.delete_process_args.lock().unwrap().clone()
    }

    pub fn get_delete_container_args(&self) -> Vec<String> {
        self.delete_container_args.lock().unwrap().clone()
    }

    pub fn get_list_filters(&self) -> Vec<String> {
        self.list_filters.lock().unwrap().clone()
    }
}

impl DaemonClient for TestHelperClient {
    fn create_container(
        &self,
        id: &str,
        labels: HashMap<String, String>,
        spec: Vec<u8>,
    ) -> ClientResult<()> {
        self.create_container_args
            .lock()
            .unwrap()
            .push(CreateContainerArgs {
                id: id.to_owned(),
                labels: labels.clone(),
                spec: spec.clone(),
            });
        self.check("create_container")?;

        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(id) {
            return Err(ClientError::AlreadyExists(id.to_owned()));
        }
        containers.insert(
            id.to_owned(),
            ContainerRecord {
                labels,
                spec,
                created_at: Some(SystemTime::now()),
            },
        );
        Ok(())
    }

    fn get_container(&self, id: &str) -> ClientResult<ContainerRecord> {
        self.check("get_container")?;
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.to_owned()))
    }

    /// Only understands the `labels."k"==v` and `labels."k"!=v` terms the
    /// driver generates.
    fn list_containers(&self, filter: &str) -> ClientResult<Vec<String>> {
        self.list_filters.lock().unwrap().push(filter.to_owned());
        self.check("list_containers")?;

        let terms: Vec<(String, bool, String)> = filter
            .split(',')
            .filter(|term| !term.is_empty())
            .filter_map(|term| {
                let rest = term.strip_prefix("labels.\"")?;
                let (label, rest) = rest.split_once('"')?;
                if let Some(value) = rest.strip_prefix("==") {
                    Some((label.to_owned(), true, value.to_owned()))
                } else {
                    rest.strip_prefix("!=")
                        .map(|value| (label.to_owned(), false, value.to_owned()))
                }
            })
            .collect();

        let mut ids: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, record)| {
                terms.iter().all(|(label, equal, value)| {
                    (record.labels.get(label) == Some(value)) == *equal
                })
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn delete_container(&self, id: &str) -> ClientResult<()> {
        self.delete_container_args.lock().unwrap().push(id.to_owned());
        self.check("delete_container")?;
        self.containers
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(id.to_owned()))
    }

    fn create_task(&self, id: &str, io: &TaskIo, io_uid: u32, io_gid: u32) -> ClientResult<u32> {
        self.create_task_args.lock().unwrap().push(CreateTaskArgs {
            id: id.to_owned(),
            io: io.clone(),
            io_uid,
            io_gid,
        });
        self.check("create_task")?;
        Ok(self.task(id, "").map(|info| info.pid).unwrap_or_default())
    }

    fn start(&self, id: &str, exec_id: &str) -> ClientResult<u32> {
        self.start_args.lock().unwrap().push(key(id, exec_id));
        self.check("start")?;
        Ok(self.task(id, exec_id).map(|info| info.pid).unwrap_or_default())
    }

    fn task(&self, id: &str, exec_id: &str) -> ClientResult<TaskInfo> {
        self.check("task")?;
        let mut tasks = self.tasks.lock().unwrap();
        let answers = tasks
            .get_mut(&key(id, exec_id))
            .ok_or_else(|| ClientError::NotFound(format!("{id}/{exec_id}")))?;
        let info = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().copied()
        };
        info.ok_or_else(|| ClientError::NotFound(format!("{id}/{exec_id}")))
    }

    fn kill(&self, id: &str, exec_id: &str, signal: u32, all: bool) -> ClientResult<()> {
        self.kill_args.lock().unwrap().push(KillArgs {
            id: id.to_owned(),
            exec_id: exec_id.to_owned(),
            signal,
            all,
        });
        self.check("kill")
    }

    fn wait(&self, id: &str, exec_id: &str, timeout: Option<Duration>) -> ClientResult<u32> {
        self.wait_args.lock().unwrap().push(WaitArgs {
            id: id.to_owned(),
            exec_id: exec_id.to_owned(),
            timeout,
        });
        self.check("wait")?;
        Ok(self
            .exit_codes
            .lock()
            .unwrap()
            .get(&key(id, exec_id))
            .copied()
            .unwrap_or_default())
    }

    fn delete_task(&self, id: &str) -> ClientResult<()> {
        self.delete_task_args.lock().unwrap().push(id.to_owned());
        self.check("delete_task")
    }

    fn delete_process(&self, id: &str, exec_id: &str) -> ClientResult<()> {
        self.delete_process_args
            .lock()
            .unwrap()
            .push(key(id, exec_id));
        self.check("delete_process")
    }

    fn exec(&self, id: &str, exec_id: &str, process: Vec<u8>, io: &TaskIo) -> ClientResult<()> {
        self.exec_args.lock().unwrap().push(ExecArgs {
            id: id.to_owned(),
            exec_id: exec_id.to_owned(),
            process,
            io: io.clone(),
        });
        self.check("exec")?;
        self.push_task(
            id,
            exec_id,
            TaskInfo {
                pid: 0,
                status: ContainerStatus::Created,
                exit_status: 0,
            },
        );
        Ok(())
    }

    fn metrics(&self, id: &str) -> ClientResult<Option<prost_types::Any>> {
        self.check("metrics")?;
        Ok(self.metrics.lock().unwrap().get(id).cloned())
    }

    fn subscribe_oom(&self) -> ClientResult<Receiver<Event>> {
        self.check("subscribe_oom")?;
        let (tx, rx) = crossbeam_channel::unbounded();
        self.oom_subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.oom_subscribers.lock().unwrap().clear();
    }
}

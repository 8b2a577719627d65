//! `DaemonClient` over the containerd gRPC socket. Every call blocks on a
//! private tokio runtime so the driver above stays synchronous.

use std::collections::HashMap;
use std::future::Future;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use containerd_client::services::v1::container::Runtime as ContainerRuntime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::events_client::EventsClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteProcessRequest, DeleteTaskRequest, ExecProcessRequest, GetContainerRequest,
    GetRequest as GetTaskRequest, KillRequest, ListContainersRequest, MetricsRequest,
    StartRequest, SubscribeRequest, WaitRequest,
};
use containerd_client::{connect, with_namespace};
use crossbeam_channel::Receiver;
use prost::Message;
use prost_types::Any;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tonic::Request;

use super::client::{ClientError, ClientResult, ContainerRecord, DaemonClient, TaskInfo, TaskIo};
use super::protos::{
    RuncOptions, TaskOom, PROCESS_TYPE_URL, RUNC_OPTIONS_TYPE_URL, SPEC_TYPE_URL, TASK_OOM_TOPIC,
};
use crate::container_manager::{ContainerStatus, Event};

pub const DEFAULT_CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
pub const DEFAULT_NAMESPACE: &str = "garden";
pub const RUNC_SHIM: &str = "io.containerd.runc.v2";

pub struct GrpcClient {
    runtime: Runtime,
    channel: Channel,
    namespace: String,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl GrpcClient {
    pub fn connect<P: AsRef<Path>>(socket: P, namespace: &str) -> ClientResult<Self> {
        let socket = socket.as_ref();
        let connect_error = |message: String| ClientError::Connect {
            socket: socket.to_path_buf(),
            message,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("containerd-client")
            .enable_all()
            .build()
            .map_err(|err| connect_error(err.to_string()))?;
        let channel = runtime
            .block_on(connect(socket))
            .map_err(|err| connect_error(err.to_string()))?;

        tracing::debug!(?socket, namespace, "connected to containerd");
        Ok(GrpcClient {
            runtime,
            channel,
            namespace: namespace.to_owned(),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn ns(&self) -> &str {
        &self.namespace
    }

    fn containers(&self) -> ContainersClient<Channel> {
        ContainersClient::new(self.channel.clone())
    }

    fn tasks(&self) -> TasksClient<Channel> {
        TasksClient::new(self.channel.clone())
    }
}

fn task_status(status: i32) -> ContainerStatus {
    match status {
        1 => ContainerStatus::Created,
        2 => ContainerStatus::Running,
        3 => ContainerStatus::Stopped,
        4 => ContainerStatus::Paused,
        5 => ContainerStatus::Pausing,
        _ => ContainerStatus::Unknown,
    }
}

/// Regular files are handed to the shim as `file://` URIs; fifos and empty
/// paths are passed through.
fn output_uri(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => path.to_owned(),
        _ => format!("file://{path}"),
    }
}

fn json_any(type_url: &str, value: Vec<u8>) -> Any {
    Any {
        type_url: type_url.to_owned(),
        value,
    }
}

impl DaemonClient for GrpcClient {
    fn create_container(
        &self,
        id: &str,
        labels: HashMap<String, String>,
        spec: Vec<u8>,
    ) -> ClientResult<()> {
        let container = Container {
            id: id.to_owned(),
            labels,
            runtime: Some(ContainerRuntime {
                name: RUNC_SHIM.to_owned(),
                options: None,
            }),
            spec: Some(json_any(SPEC_TYPE_URL, spec)),
            ..Default::default()
        };
        let req = CreateContainerRequest {
            container: Some(container),
        };
        let req = with_namespace!(req, self.ns());
        self.block_on(self.containers().create(req))?;
        Ok(())
    }

    fn get_container(&self, id: &str) -> ClientResult<ContainerRecord> {
        let req = GetContainerRequest { id: id.to_owned() };
        let req = with_namespace!(req, self.ns());
        let container = self
            .block_on(self.containers().get(req))?
            .into_inner()
            .container
            .ok_or_else(|| ClientError::NotFound(id.to_owned()))?;

        Ok(ContainerRecord {
            labels: container.labels,
            spec: container.spec.map(|spec| spec.value).unwrap_or_default(),
            created_at: container
                .created_at
                .and_then(|ts| SystemTime::try_from(ts).ok()),
        })
    }

    fn list_containers(&self, filter: &str) -> ClientResult<Vec<String>> {
        let filters = if filter.is_empty() {
            Vec::new()
        } else {
            vec![filter.to_owned()]
        };
        let req = ListContainersRequest { filters };
        let req = with_namespace!(req, self.ns());
        let containers = self.block_on(self.containers().list(req))?.into_inner().containers;
        Ok(containers.into_iter().map(|c| c.id).collect())
    }

    fn delete_container(&self, id: &str) -> ClientResult<()> {
        let req = DeleteContainerRequest { id: id.to_owned() };
        let req = with_namespace!(req, self.ns());
        self.block_on(self.containers().delete(req))?;
        Ok(())
    }

    fn create_task(&self, id: &str, io: &TaskIo, io_uid: u32, io_gid: u32) -> ClientResult<u32> {
        let options = RuncOptions { io_uid, io_gid };
        let req = CreateTaskRequest {
            container_id: id.to_owned(),
            stdin: io.stdin.clone(),
            stdout: output_uri(&io.stdout),
            stderr: output_uri(&io.stderr),
            terminal: io.terminal,
            options: Some(Any {
                type_url: RUNC_OPTIONS_TYPE_URL.to_owned(),
                value: options.encode_to_vec(),
            }),
            ..Default::default()
        };
        let req = with_namespace!(req, self.ns());
        Ok(self.block_on(self.tasks().create(req))?.into_inner().pid)
    }

    fn start(&self, id: &str, exec_id: &str) -> ClientResult<u32> {
        let req = StartRequest {
            container_id: id.to_owned(),
            exec_id: exec_id.to_owned(),
        };
        let req = with_namespace!(req, self.ns());
        Ok(self.block_on(self.tasks().start(req))?.into_inner().pid)
    }

    fn task(&self, id: &str, exec_id: &str) -> ClientResult<TaskInfo> {
        let req = GetTaskRequest {
            container_id: id.to_owned(),
            exec_id: exec_id.to_owned(),
        };
        let req = with_namespace!(req, self.ns());
        let process = self
            .block_on(self.tasks().get(req))?
            .into_inner()
            .process
            .ok_or_else(|| ClientError::NotFound(format!("task {id}")))?;

        Ok(TaskInfo {
            pid: process.pid,
            status: task_status(process.status),
            exit_status: process.exit_status,
        })
    }

    fn kill(&self, id: &str, exec_id: &str, signal: u32, all: bool) -> ClientResult<()> {
        let req = KillRequest {
            container_id: id.to_owned(),
            exec_id: exec_id.to_owned(),
            signal,
            all,
        };
        let req = with_namespace!(req, self.ns());
        self.block_on(self.tasks().kill(req))?;
        Ok(())
    }

    fn wait(&self, id: &str, exec_id: &str, timeout: Option<Duration>) -> ClientResult<u32> {
        let req = WaitRequest {
            container_id: id.to_owned(),
            exec_id: exec_id.to_owned(),
        };
        let req = with_namespace!(req, self.ns());
        let mut tasks = self.tasks();

        let response = self.block_on(async {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, tasks.wait(req))
                    .await
                    .map_err(|_| {
                        ClientError::DeadlineExceeded(format!(
                            "waiting {timeout:?} for {id}/{exec_id}"
                        ))
                    })?
                    .map_err(ClientError::from),
                None => tasks.wait(req).await.map_err(ClientError::from),
            }
        })?;
        Ok(response.into_inner().exit_status)
    }

    fn delete_task(&self, id: &str) -> ClientResult<()> {
        let req = DeleteTaskRequest {
            container_id: id.to_owned(),
        };
        let req = with_namespace!(req, self.ns());
        self.block_on(self.tasks().delete(req))?;
        Ok(())
    }

    fn delete_process(&self, id: &str, exec_id: &str) -> ClientResult<()> {
        let req = DeleteProcessRequest {
            container_id: id.to_owned(),
            exec_id: exec_id.to_owned(),
        };
        let req = with_namespace!(req, self.ns());
        self.block_on(self.tasks().delete_process(req))?;
        Ok(())
    }

    fn exec(&self, id: &str, exec_id: &str, process: Vec<u8>, io: &TaskIo) -> ClientResult<()> {
        let req = ExecProcessRequest {
            container_id: id.to_owned(),
            stdin: io.stdin.clone(),
            stdout: output_uri(&io.stdout),
            stderr: output_uri(&io.stderr),
            terminal: io.terminal,
            spec: Some(json_any(PROCESS_TYPE_URL, process)),
            exec_id: exec_id.to_owned(),
        };
        let req = with_namespace!(req, self.ns());
        self.block_on(self.tasks().exec(req))?;
        Ok(())
    }

    fn metrics(&self, id: &str) -> ClientResult<Option<Any>> {
        let req = MetricsRequest {
            filters: vec![format!("id=={id}")],
        };
        let req = with_namespace!(req, self.ns());
        let metrics = self.block_on(self.tasks().metrics(req))?.into_inner().metrics;
        Ok(metrics.into_iter().next().and_then(|metric| metric.data))
    }

    fn subscribe_oom(&self) -> ClientResult<Receiver<Event>> {
        let req = SubscribeRequest {
            filters: vec![format!("topic==\"{TASK_OOM_TOPIC}\"")],
        };
        let req = with_namespace!(req, self.ns());
        let mut events = EventsClient::new(self.channel.clone());
        let mut stream = self.block_on(events.subscribe(req))?.into_inner();

        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = self.runtime.spawn(async move {
            loop {
                let envelope = match stream.message().await {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => break,
                    Err(status) => {
                        tracing::warn!(%status, "oom event subscription failed");
                        break;
                    }
                };
                let Some(event) = envelope.event else {
                    continue;
                };
                match TaskOom::decode(event.value.as_slice()) {
                    Ok(oom) => {
                        if tx.send(Event::oom(&oom.container_id)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, topic = %envelope.topic, "undecodable oom event")
                    }
                }
            }
            tracing::debug!("oom event subscription ended");
        });

        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(rx)
    }

    fn close(&self) {
        for handle in self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
    }
}

impl Drop for GrpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

use futures_util::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{DeleteParams, LogParams, PostParams};
use kube::{Api, Client};
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::config::{POD_COMPLETE_POLL, POD_START_POLL};
use crate::error::{self, Error, Result};

/// Runs one-shot task pods to completion.
pub struct PodRunner {
    client: Client,
}

impl PodRunner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Creates `pod`, waits for it to start, tails its logs and waits for
    /// it to terminate. A non-zero exit code fails the run.
    ///
    /// The pod is deleted on every exit path, including cancellation, and
    /// any leftover pod with the same name is removed up front. The pod
    /// spec is used as given.
    pub async fn run_pod(
        &self,
        cancel: &Cancellation,
        namespace: &str,
        name: &str,
        pod: Pod,
    ) -> Result<()> {
        let pods = self.pods(namespace);

        // remove leftovers of a previous attempt
        self.delete_pod(&pods, name).await?;

        let result = self.execute(cancel, &pods, name, pod).await;

        if let Err(err) = self.delete_pod(&pods, name).await {
            debug!("failed to clean up task pod {name:?}: {err}");
        }
        result
    }

    async fn execute(
        &self,
        cancel: &Cancellation,
        pods: &Api<Pod>,
        name: &str,
        pod: Pod,
    ) -> Result<()> {
        pods.create(&PostParams::default(), &pod)
            .await
            .map_err(Error::api(format!("failed to create task pod {name:?}")))?;

        self.wait_for_start(cancel, pods, name).await?;
        self.tail_logs(cancel, pods, name).await?;
        self.wait_for_completion(cancel, pods, name).await?;
        info!("task pod {name:?} has completed");
        Ok(())
    }

    async fn delete_pod(&self, pods: &Api<Pod>, name: &str) -> Result<()> {
        match pods.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(err) if error::not_found(&err) => Ok(()),
            Err(err) => Err(Error::api(format!("failed to delete task pod {name:?}"))(err)),
        }
    }

    async fn wait_for_start(
        &self,
        cancel: &Cancellation,
        pods: &Api<Pod>,
        name: &str,
    ) -> Result<()> {
        loop {
            let pod = pods
                .get(name)
                .await
                .map_err(Error::api(format!("failed to get task pod {name:?}")))?;
            if let Some(exit_code) = failed_init_container(&pod) {
                return Err(Error::PodFailed {
                    pod: name.to_string(),
                    exit_code,
                });
            }
            if has_started_container(&pod) {
                return Ok(());
            }
            cancel.sleep(POD_START_POLL).await?;
        }
    }

    /// Follows the pod's log stream, surfacing each line tagged with the
    /// pod name. Returns when the stream ends or the deadline fires.
    async fn tail_logs(&self, cancel: &Cancellation, pods: &Api<Pod>, name: &str) -> Result<()> {
        let params = LogParams {
            follow: true,
            ..LogParams::default()
        };
        let stream = pods
            .log_stream(name, &params)
            .await
            .map_err(Error::api(format!("failed to stream logs of task pod {name:?}")))?;
        tokio::pin!(stream);

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = cancel
                .guard(stream.try_next())
                .await?
                .map_err(Error::api(format!("log stream of task pod {name:?} failed")))?;
            let Some(chunk) = chunk else { break };

            buffer.extend_from_slice(&chunk);
            while let Some(newline) = buffer.iter().position(|&byte| byte == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                emit_log_line(name, &line[..line.len() - 1]);
            }
        }
        if !buffer.is_empty() {
            emit_log_line(name, &buffer);
        }
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        cancel: &Cancellation,
        pods: &Api<Pod>,
        name: &str,
    ) -> Result<()> {
        loop {
            let pod = pods
                .get(name)
                .await
                .map_err(Error::api(format!("failed to get task pod {name:?}")))?;
            if let Some(exit_code) = failed_init_container(&pod) {
                return Err(Error::PodFailed {
                    pod: name.to_string(),
                    exit_code,
                });
            }
            if let Some(exit_code) = terminated_container(&pod) {
                if exit_code == 0 {
                    return Ok(());
                }
                return Err(Error::PodFailed {
                    pod: name.to_string(),
                    exit_code,
                });
            }
            cancel.sleep(POD_COMPLETE_POLL).await?;
        }
    }
}

fn emit_log_line(pod: &str, line: &[u8]) {
    info!("[{}]: {}", pod, String::from_utf8_lossy(line));
}

/// Exit code of the first main container that has terminated.
fn terminated_container(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find_map(|status| {
            status
                .state
                .as_ref()?
                .terminated
                .as_ref()
                .map(|terminated| terminated.exit_code)
        })
}

/// Whether any main container has begun running (or already finished).
fn has_started_container(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map_or(false, |statuses| {
            statuses.iter().any(|status| {
                status
                    .state
                    .as_ref()
                    .map_or(false, |state| state.running.is_some() || state.terminated.is_some())
            })
        })
}

/// Exit code of an init container that terminated unsuccessfully. With
/// restart policy Never such a pod can never make progress again.
fn failed_init_container(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .init_container_statuses
        .as_ref()?
        .iter()
        .find_map(|status| {
            status
                .state
                .as_ref()?
                .terminated
                .as_ref()
                .map(|terminated| terminated.exit_code)
                .filter(|&code| code != 0)
        })
}

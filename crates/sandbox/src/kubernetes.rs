// Kubernetes implementation of the Sandbox trait
//
// Each task gets its own namespace (`task-<task8>`) with the credential
// secrets copied in from the home namespace. Executor jobs run as
// `batch/v1` Jobs with `backoff_limit: 0` (the worker workflow owns the
// retry policy, not the cluster) and a TTL so finished jobs get reaped.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec as K8sJobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, Namespace, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, SecretKeySelector, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, ObjectList, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{JobSpec, Sandbox, SandboxError};

/// Namespace prefix for task sandboxes
const TASK_NAMESPACE_PREFIX: &str = "task-";

/// Keep finished jobs around for an hour
const JOB_TTL_SECONDS: i32 = 3600;

/// Secrets copied from the home namespace into every sandbox
const SECRETS_TO_COPY: &[&str] = &["foreman-secrets", "ghcr-secret"];

/// Service account the job pods run under
const WORKER_SERVICE_ACCOUNT: &str = "foreman-worker";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const TASK_ID_LABEL: &str = "foreman.dev/task-id";
const MODE_LABEL: &str = "foreman.dev/mode";

/// Kubernetes-backed sandbox manager
#[derive(Clone)]
pub struct KubernetesSandbox {
    client: Client,
    /// Namespace holding the source secrets
    home_namespace: String,
    /// Executor image
    image: String,
}

impl KubernetesSandbox {
    /// Connect using in-cluster config or the local kubeconfig
    pub async fn new(
        home_namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Result<Self, SandboxError> {
        let client = Client::try_default()
            .await
            .map_err(|e| SandboxError::Platform(format!("failed to create kube client: {e}")))?;
        Ok(Self {
            client,
            home_namespace: home_namespace.into(),
            image: image.into(),
        })
    }

    /// Namespace name for a task
    pub fn namespace_for(task_id: Uuid) -> String {
        format!("{TASK_NAMESPACE_PREFIX}{}", &task_id.simple().to_string()[..8])
    }

    fn labels(task_id: Uuid) -> BTreeMap<String, String> {
        BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), "foreman".to_string()),
            (TASK_ID_LABEL.to_string(), task_id.to_string()),
        ])
    }

    async fn copy_secrets(&self, namespace: &str) -> Result<(), SandboxError> {
        let source: Api<Secret> = Api::namespaced(self.client.clone(), &self.home_namespace);
        let target: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        for name in SECRETS_TO_COPY {
            let secret = match source.get(name).await {
                Ok(secret) => secret,
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    warn!(secret = name, "source secret missing, skipping copy");
                    continue;
                }
                Err(e) => return Err(SandboxError::Platform(e.to_string())),
            };

            let copy = Secret {
                metadata: ObjectMeta {
                    name: Some((*name).to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                data: secret.data,
                type_: secret.type_,
                ..Default::default()
            };

            match target.create(&PostParams::default(), &copy).await {
                Ok(_) => debug!(secret = name, namespace, "copied secret"),
                Err(kube::Error::Api(e)) if e.code == 409 => {}
                Err(e) => return Err(SandboxError::Provision(e.to_string())),
            }
        }

        Ok(())
    }

    fn secret_env(name: &str, secret: &str, key: &str, optional: bool) -> EnvVar {
        EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret.to_string(),
                    key: key.to_string(),
                    optional: Some(optional),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_job(&self, spec: &JobSpec, namespace: &str) -> Job {
        let mut env: Vec<EnvVar> = spec
            .env()
            .into_iter()
            .map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                ..Default::default()
            })
            .collect();
        env.push(Self::secret_env(
            "CLAUDE_CODE_OAUTH_TOKEN",
            "foreman-secrets",
            "claude-secret-token",
            false,
        ));
        env.push(Self::secret_env(
            "GH_TOKEN",
            "foreman-secrets",
            "github-token",
            true,
        ));

        let mut labels = Self::labels(spec.task_id);
        labels.insert(MODE_LABEL.to_string(), spec.mode.as_str().to_string());

        Job {
            metadata: ObjectMeta {
                name: Some(spec.job_name()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(K8sJobSpec {
                ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        service_account_name: Some(WORKER_SERVICE_ACCOUNT.to_string()),
                        image_pull_secrets: Some(vec![
                            k8s_openapi::api::core::v1::LocalObjectReference {
                                name: "ghcr-secret".to_string(),
                            },
                        ]),
                        containers: vec![Container {
                            name: "agent-runner".to_string(),
                            image: Some(self.image.clone()),
                            env: Some(env),
                            resources: Some(ResourceRequirements {
                                requests: Some(BTreeMap::from([
                                    ("memory".to_string(), Quantity("512Mi".to_string())),
                                    ("cpu".to_string(), Quantity("500m".to_string())),
                                ])),
                                limits: Some(BTreeMap::from([
                                    ("memory".to_string(), Quantity("2Gi".to_string())),
                                    ("cpu".to_string(), Quantity("2".to_string())),
                                ])),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "workspace".to_string(),
                                mount_path: "/workspace".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: "workspace".to_string(),
                            empty_dir: Some(Default::default()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Whether a job already finished (succeeded or failed)
    fn job_finished(job: &Job) -> bool {
        job.status
            .as_ref()
            .map(|s| s.succeeded.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0)
            .unwrap_or(false)
    }

    async fn task_pods(&self, task_id: Uuid, namespace: &str) -> Result<ObjectList<Pod>, SandboxError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.list(&ListParams::default().labels(&format!("{TASK_ID_LABEL}={task_id}")))
            .await
            .map_err(|e| SandboxError::Platform(e.to_string()))
    }
}

#[async_trait]
impl Sandbox for KubernetesSandbox {
    async fn create(&self, task_id: Uuid) -> Result<String, SandboxError> {
        let name = Self::namespace_for(task_id);
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(Self::labels(task_id)),
                ..Default::default()
            },
            ..Default::default()
        };

        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => info!(namespace = %name, %task_id, "created sandbox namespace"),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(namespace = %name, "sandbox namespace already exists");
            }
            Err(e) => return Err(SandboxError::Provision(e.to_string())),
        }

        self.copy_secrets(&name).await?;
        Ok(name)
    }

    async fn destroy(&self, task_id: Uuid) -> Result<(), SandboxError> {
        let name = Self::namespace_for(task_id);
        let namespaces: Api<Namespace> = Api::all(self.client.clone());

        match namespaces.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(namespace = %name, %task_id, "deleted sandbox namespace");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(SandboxError::Teardown(e.to_string())),
        }
    }

    async fn launch_job(&self, spec: &JobSpec) -> Result<String, SandboxError> {
        let namespace = Self::namespace_for(spec.task_id);
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        let job_name = spec.job_name();

        // A finished job with the same identity blocks recreation; delete it
        // so retries with the same name can proceed
        match jobs.get(&job_name).await {
            Ok(existing) if Self::job_finished(&existing) => {
                debug!(job = %job_name, "deleting finished job before relaunch");
                jobs.delete(&job_name, &DeleteParams::background())
                    .await
                    .map_err(|e| SandboxError::Launch(e.to_string()))?;
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(SandboxError::Platform(e.to_string())),
        }

        let job = self.build_job(spec, &namespace);
        match jobs.create(&PostParams::default(), &job).await {
            Ok(_) => {
                info!(job = %job_name, namespace = %namespace, mode = %spec.mode, "launched executor job");
                Ok(job_name)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(job = %job_name, "job already exists");
                Ok(job_name)
            }
            Err(e) => Err(SandboxError::Launch(e.to_string())),
        }
    }

    async fn job_logs(&self, task_id: Uuid) -> Result<Option<String>, SandboxError> {
        let namespace = Self::namespace_for(task_id);
        let pod_list = match self.task_pods(task_id, &namespace).await {
            Ok(list) => list,
            Err(_) => return Ok(None),
        };

        let Some(pod) = pod_list.items.into_iter().next() else {
            return Ok(None);
        };
        let Some(pod_name) = pod.metadata.name else {
            return Ok(None);
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        match pods
            .logs(
                &pod_name,
                &LogParams {
                    container: Some("agent-runner".to_string()),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(logs) => Ok(Some(logs)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(SandboxError::Platform(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_naming() {
        let task_id = Uuid::nil();
        assert_eq!(KubernetesSandbox::namespace_for(task_id), "task-00000000");
    }

    #[test]
    fn test_job_finished_detection() {
        let mut job = Job::default();
        assert!(!KubernetesSandbox::job_finished(&job));

        job.status = Some(k8s_openapi::api::batch::v1::JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert!(KubernetesSandbox::job_finished(&job));

        job.status = Some(k8s_openapi::api::batch::v1::JobStatus {
            failed: Some(1),
            ..Default::default()
        });
        assert!(KubernetesSandbox::job_finished(&job));
    }
}

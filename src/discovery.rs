//! Task discovery against the ECS API
//!
//! The reconciler only needs one capability: "give me the running tasks
//! for this cluster and family/service". That is the [`TaskSource`]
//! trait, so tests can substitute a canned sequence of task lists with
//! no network involved. [`EcsClient`] is the real implementation: the
//! ECS JSON protocol (ListTasks, DescribeTasks,
//! DescribeContainerInstances) joined with EC2 DescribeInstances to
//! resolve each task's public and private host addresses, all
//! SigV4-signed.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::aws::{sign_request, Credentials};
use crate::error::DiscoveryError;
use crate::topology::{Container, PortBinding, Protocol, Task};

const ECS_TARGET_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";

const EC2_API_VERSION: &str = "2016-11-15";

const RUNNING_STATUS: &str = "RUNNING";

/// Maximum number of elements per describe call, on both APIs.
const DESCRIBE_CHUNK_SIZE: usize = 100;

/// Identifies which tasks to discover and which container within them
/// to impersonate. Exactly one of `family` and `service` should be set;
/// the CLI enforces that.
#[derive(Debug, Clone)]
pub struct TaskFilter {
    pub cluster: String,
    /// Task family, optionally with revision ("myapp" or "myapp:3")
    pub family: Option<String>,
    /// Service name; mutually exclusive with `family`
    pub service: Option<String>,
    /// Container name within the task whose ports we mirror
    pub container: String,
    /// Proxy to public addresses instead of private ones
    pub public: bool,
}

/// A source of point-in-time running-task lists. One operation, so a
/// test double is a few lines.
pub trait TaskSource {
    fn tasks(
        &self,
        filter: &TaskFilter,
    ) -> impl Future<Output = Result<Vec<Task>, DiscoveryError>> + Send;
}

/// ECS API client. A round is: ListTasks (paginated), DescribeTasks in
/// chunks, then the address join - container instances to their EC2
/// instances - so every task carries the public and private IP of the
/// host it runs on. Tasks on awsvpc networking fall back to the ENI
/// attachment for their private address.
pub struct EcsClient {
    http: reqwest::Client,
    region: String,
    credentials: Credentials,
    ecs_host: String,
    ecs_endpoint: String,
    ec2_host: String,
    ec2_endpoint: String,
}

impl EcsClient {
    pub fn new(region: String, credentials: Credentials) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let ecs_host = format!("ecs.{}.amazonaws.com", region);
        let ecs_endpoint = format!("https://{}/", ecs_host);
        let ec2_host = format!("ec2.{}.amazonaws.com", region);
        let ec2_endpoint = format!("https://{}/", ec2_host);
        Ok(Self {
            http,
            region,
            credentials,
            ecs_host,
            ecs_endpoint,
            ec2_host,
            ec2_endpoint,
        })
    }

    /// One signed call against either API. The payload and content type
    /// differ (x-amz-json-1.1 with a target header for ECS, a form-
    /// encoded query for EC2) but the signing and error handling are
    /// the same.
    async fn signed_call(
        &self,
        service: &str,
        host: &str,
        endpoint: &str,
        extra_headers: &[(&str, String)],
        content_type: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, DiscoveryError> {
        let amz_date = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = std::collections::BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        headers.insert("host".to_string(), host.to_string());
        headers.insert("x-amz-date".to_string(), amz_date.clone());
        for (name, value) in extra_headers {
            headers.insert(name.to_string(), value.clone());
        }
        if let Some(token) = &self.credentials.session_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }

        let authorization = sign_request(
            &self.credentials,
            &self.region,
            service,
            "POST",
            "/",
            &headers,
            &payload,
            &amz_date,
        );

        let mut request = self.http.post(endpoint).body(payload);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request = request.header("authorization", authorization);

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(api_error(&bytes, status.as_u16()));
        }
        Ok(bytes.to_vec())
    }

    async fn ecs_call(&self, action: &str, body: &Value) -> Result<Vec<u8>, DiscoveryError> {
        let payload =
            serde_json::to_vec(body).map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
        let target = format!("{}.{}", ECS_TARGET_PREFIX, action);
        self.signed_call(
            "ecs",
            &self.ecs_host,
            &self.ecs_endpoint,
            &[("x-amz-target", target)],
            "application/x-amz-json-1.1",
            payload,
        )
        .await
    }

    async fn ec2_call(&self, action: &str, params: &[(String, String)]) -> Result<Vec<u8>, DiscoveryError> {
        let mut body = format!("Action={}&Version={}", action, EC2_API_VERSION);
        for (name, value) in params {
            body.push('&');
            body.push_str(name);
            body.push('=');
            body.push_str(value);
        }
        self.signed_call(
            "ec2",
            &self.ec2_host,
            &self.ec2_endpoint,
            &[],
            "application/x-www-form-urlencoded",
            body.into_bytes(),
        )
        .await
    }

    async fn list_task_arns(&self, filter: &TaskFilter) -> Result<Vec<String>, DiscoveryError> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut body = json!({
                "cluster": filter.cluster,
                "desiredStatus": RUNNING_STATUS,
            });
            if let Some(family) = &filter.family {
                body["family"] = json!(family);
            }
            if let Some(service) = &filter.service {
                body["serviceName"] = json!(service);
            }
            if let Some(token) = &next_token {
                body["nextToken"] = json!(token);
            }

            let bytes = self.ecs_call("ListTasks", &body).await?;
            let page: ListTasksResponse = serde_json::from_slice(&bytes)
                .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
            arns.extend(page.task_arns);
            match page.next_token {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(arns)
    }

    async fn describe_tasks(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> Result<Vec<WireTask>, DiscoveryError> {
        let mut tasks = Vec::with_capacity(arns.len());
        for chunk in arns.chunks(DESCRIBE_CHUNK_SIZE) {
            let body = json!({
                "cluster": cluster,
                "tasks": chunk,
            });
            let bytes = self.ecs_call("DescribeTasks", &body).await?;
            let page: DescribeTasksResponse = serde_json::from_slice(&bytes)
                .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
            for failure in &page.failures {
                debug!(
                    arn = failure.arn.as_deref().unwrap_or("<unknown>"),
                    reason = failure.reason.as_deref().unwrap_or("<none>"),
                    "task could not be described"
                );
            }
            tasks.extend(page.tasks);
        }
        Ok(tasks)
    }

    /// Map container-instance ARNs to their EC2 instance ids.
    async fn describe_container_instances(
        &self,
        cluster: &str,
        arns: &[String],
    ) -> Result<HashMap<String, String>, DiscoveryError> {
        let mut instances = HashMap::with_capacity(arns.len());
        for chunk in arns.chunks(DESCRIBE_CHUNK_SIZE) {
            let body = json!({
                "cluster": cluster,
                "containerInstances": chunk,
            });
            let bytes = self.ecs_call("DescribeContainerInstances", &body).await?;
            let page: DescribeContainerInstancesResponse = serde_json::from_slice(&bytes)
                .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
            for ci in page.container_instances {
                if let Some(ec2_id) = ci.ec2_instance_id {
                    instances.insert(ci.container_instance_arn, ec2_id);
                }
            }
        }
        Ok(instances)
    }

    /// Map EC2 instance ids to their public/private addresses.
    async fn describe_instances(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, InstanceAddresses>, DiscoveryError> {
        let mut addresses = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(DESCRIBE_CHUNK_SIZE) {
            let params: Vec<(String, String)> = chunk
                .iter()
                .enumerate()
                .map(|(i, id)| (format!("InstanceId.{}", i + 1), id.clone()))
                .collect();
            let bytes = self.ec2_call("DescribeInstances", &params).await?;
            let text = String::from_utf8_lossy(&bytes);
            let page: DescribeInstancesResponse = quick_xml::de::from_str(&text)
                .map_err(|e| DiscoveryError::Malformed(e.to_string()))?;
            for reservation in page.reservation_set.item {
                for instance in reservation.instances_set.item {
                    addresses.insert(
                        instance.instance_id,
                        InstanceAddresses {
                            private_ip: instance.private_ip_address,
                            public_ip: instance.ip_address,
                        },
                    );
                }
            }
        }
        Ok(addresses)
    }

    /// The container-instance/EC2-instance join: addresses keyed by
    /// container-instance ARN, for every instance the given tasks run
    /// on.
    async fn host_addresses(
        &self,
        cluster: &str,
        tasks: &[WireTask],
    ) -> Result<HashMap<String, InstanceAddresses>, DiscoveryError> {
        let mut ci_arns: Vec<String> = tasks
            .iter()
            .filter_map(|t| t.container_instance_arn.clone())
            .collect();
        ci_arns.sort_unstable();
        ci_arns.dedup();
        if ci_arns.is_empty() {
            return Ok(HashMap::new());
        }

        let ci_to_ec2 = self.describe_container_instances(cluster, &ci_arns).await?;
        let mut ec2_ids: Vec<String> = ci_to_ec2.values().cloned().collect();
        ec2_ids.sort_unstable();
        ec2_ids.dedup();

        let ec2_addresses = self.describe_instances(&ec2_ids).await?;
        Ok(ci_to_ec2
            .into_iter()
            .filter_map(|(ci_arn, ec2_id)| {
                ec2_addresses.get(&ec2_id).cloned().map(|addrs| (ci_arn, addrs))
            })
            .collect())
    }
}

impl TaskSource for EcsClient {
    async fn tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, DiscoveryError> {
        let arns = self.list_task_arns(filter).await?;
        debug!(count = arns.len(), cluster = %filter.cluster, "listed tasks");
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let wire_tasks = self.describe_tasks(&filter.cluster, &arns).await?;
        let addresses = self.host_addresses(&filter.cluster, &wire_tasks).await?;
        Ok(reduce_tasks(wire_tasks, &addresses))
    }
}

/// Public and private addresses of one EC2 instance.
#[derive(Debug, Clone)]
struct InstanceAddresses {
    private_ip: Option<String>,
    public_ip: Option<String>,
}

fn api_error(body: &[u8], status: u16) -> DiscoveryError {
    #[derive(Deserialize)]
    struct ApiErrorBody {
        #[serde(rename = "__type")]
        kind: Option<String>,
        #[serde(alias = "Message")]
        message: Option<String>,
    }

    match serde_json::from_slice::<ApiErrorBody>(body) {
        Ok(parsed) => {
            let kind = parsed.kind.unwrap_or_else(|| format!("http {}", status));
            // Error types arrive as "prefix#ShortName"; keep the short name.
            let code = kind.rsplit('#').next().unwrap_or(kind.as_str()).to_string();
            DiscoveryError::Api {
                code,
                message: parsed.message.unwrap_or_default(),
            }
        }
        Err(_) => DiscoveryError::Api {
            code: format!("http {}", status),
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

// Wire shapes for the subset of the API responses we consume.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTasksResponse {
    #[serde(default)]
    task_arns: Vec<String>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeTasksResponse {
    #[serde(default)]
    tasks: Vec<WireTask>,
    #[serde(default)]
    failures: Vec<WireFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFailure {
    arn: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTask {
    #[serde(default)]
    task_arn: String,
    #[serde(default)]
    last_status: String,
    container_instance_arn: Option<String>,
    #[serde(default)]
    containers: Vec<WireContainer>,
    #[serde(default)]
    attachments: Vec<WireAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContainer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    last_status: String,
    #[serde(default)]
    network_bindings: Vec<WireBinding>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBinding {
    container_port: Option<u16>,
    host_port: Option<u16>,
    protocol: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttachment {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    details: Vec<WireDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDetail {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeContainerInstancesResponse {
    #[serde(default)]
    container_instances: Vec<WireContainerInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireContainerInstance {
    #[serde(default)]
    container_instance_arn: String,
    ec2_instance_id: Option<String>,
}

// EC2 DescribeInstances speaks the Query protocol; responses are XML
// with every collection wrapped in <item> elements.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservation_set: ItemList<WireReservation>,
}

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    item: Vec<T>,
}

impl<T> Default for ItemList<T> {
    fn default() -> Self {
        Self { item: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReservation {
    #[serde(default)]
    instances_set: ItemList<WireInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireInstance {
    #[serde(default)]
    instance_id: String,
    private_ip_address: Option<String>,
    /// The public address, when the instance has one
    ip_address: Option<String>,
}

/// Reduce described tasks to the domain model, keeping only tasks the
/// scheduler reports as running (ListTasks filters on *desired* status,
/// which also returns tasks still starting up) and attaching each
/// task's host addresses from the instance join.
fn reduce_tasks(
    wire_tasks: Vec<WireTask>,
    addresses: &HashMap<String, InstanceAddresses>,
) -> Vec<Task> {
    wire_tasks
        .into_iter()
        .filter(|t| t.last_status == RUNNING_STATUS)
        .map(|t| reduce_task(t, addresses))
        .collect()
}

fn reduce_task(wire: WireTask, addresses: &HashMap<String, InstanceAddresses>) -> Task {
    let instance = wire
        .container_instance_arn
        .as_ref()
        .and_then(|arn| addresses.get(arn));

    // awsvpc tasks have no container instance to join against; their
    // private address lives on the ENI attachment instead.
    let eni_ip = wire
        .attachments
        .iter()
        .filter(|a| a.kind == "ElasticNetworkInterface")
        .flat_map(|a| a.details.iter())
        .find(|d| d.name == "privateIPv4Address")
        .map(|d| d.value.clone());

    Task {
        arn: wire.task_arn,
        last_status: wire.last_status,
        private_ip: instance.and_then(|a| a.private_ip.clone()).or(eni_ip),
        public_ip: instance.and_then(|a| a.public_ip.clone()),
        containers: wire.containers.into_iter().map(Container::from).collect(),
    }
}

impl From<WireContainer> for Container {
    fn from(wire: WireContainer) -> Self {
        Container {
            name: wire.name,
            last_status: wire.last_status,
            bindings: wire
                .network_bindings
                .into_iter()
                .filter_map(|b| {
                    let container_port = b.container_port?;
                    let host_port = b.host_port?;
                    let protocol = match b.protocol.as_deref() {
                        Some("udp") => Protocol::Udp,
                        // Absent protocol means tcp
                        _ => Protocol::Tcp,
                    };
                    Some(PortBinding {
                        container_port,
                        host_port,
                        protocol,
                    })
                })
                .collect(),
        }
    }
}

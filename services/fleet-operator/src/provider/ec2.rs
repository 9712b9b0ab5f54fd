//! EC2-backed [`ComputeProvider`].

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::config::{Credentials, Region as AwsRegion};
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    Filter, Instance, InstanceType, LaunchTemplateSpecification, ResourceType, Tag,
    TagSpecification,
};
use aws_sdk_ec2::Client;
use chrono::{DateTime, Utc};
use psfleet_id::ProviderInstanceId;
use psfleet_reconcile::{ObservedInstance, ProviderState};
use tracing::{debug, info, instrument, warn};

use super::{
    with_deadline, with_dry_run_probe, ComputeProvider, DescribeFilter, LaunchTemplate,
    ProviderConnector, ProviderError, ProviderResult, ProviderSettings, Reservation,
};
use crate::db::Region;

/// Access key pair taken from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Builds one EC2 client per region.
///
/// Without static credentials the default provider chain is used.
#[derive(Debug, Clone)]
pub struct Ec2Connector {
    credentials: Option<StaticCredentials>,
    settings: ProviderSettings,
}

impl Ec2Connector {
    pub fn new(credentials: Option<StaticCredentials>, settings: ProviderSettings) -> Self {
        Self {
            credentials,
            settings,
        }
    }
}

#[async_trait]
impl ProviderConnector for Ec2Connector {
    #[instrument(skip(self, region), fields(region = %region.name))]
    async fn connect(&self, region: &Region) -> ProviderResult<Box<dyn ComputeProvider>> {
        if region.name.trim().is_empty() {
            return Err(ProviderError::Config {
                region: region.id.to_string(),
                message: "region has no provider name".to_string(),
            });
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(AwsRegion::new(region.name.clone()));
        if let Some(credentials) = &self.credentials {
            loader = loader.credentials_provider(Credentials::new(
                credentials.access_key.clone(),
                credentials.secret_key.clone(),
                None,
                None,
                "fleet-operator-env",
            ));
        }

        let limit = self.settings.call_timeout;
        let sdk_config = tokio::time::timeout(limit, loader.load())
            .await
            .map_err(|_| ProviderError::Timeout {
                operation: "load_config",
                limit,
            })?;

        debug!("EC2 client ready");

        Ok(Box::new(Ec2Provider {
            client: Client::new(&sdk_config),
            region: region.name.clone(),
            settings: self.settings.clone(),
        }))
    }
}

/// EC2 client bound to one region.
pub struct Ec2Provider {
    client: Client,
    region: String,
    settings: ProviderSettings,
}

impl Ec2Provider {
    async fn call<T, E, R>(
        &self,
        operation: &'static str,
        send: impl Future<Output = Result<T, SdkError<E, R>>>,
    ) -> ProviderResult<T>
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
        R: fmt::Debug,
    {
        with_deadline(operation, self.settings.call_timeout, async move {
            send.await.map_err(|e| classify(operation, e))
        })
        .await
    }

    async fn terminate_batch(&self, ids: &[String]) -> ProviderResult<()> {
        with_dry_run_probe(
            "terminate_instances",
            self.settings.dry_run_probe,
            |dry_run| {
                let request = self
                    .client
                    .terminate_instances()
                    .set_instance_ids(Some(ids.to_vec()))
                    .dry_run(dry_run);
                self.call("terminate_instances", request.send())
            },
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl ComputeProvider for Ec2Provider {
    #[instrument(skip(self, template), fields(region = %self.region, track = %template.track))]
    async fn launch(
        &self,
        template: &LaunchTemplate,
        count: u32,
    ) -> ProviderResult<Vec<ObservedInstance>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let max_count = i32::try_from(count).unwrap_or(i32::MAX);

        let output = with_dry_run_probe("run_instances", self.settings.dry_run_probe, |dry_run| {
            let request = self
                .client
                .run_instances()
                .launch_template(
                    LaunchTemplateSpecification::builder()
                        .launch_template_id(&template.launch_template_id)
                        .build(),
                )
                .image_id(&template.image_id)
                .instance_type(InstanceType::from(template.instance_type.as_str()))
                .set_key_name(template.key_name.clone())
                .min_count(1)
                .max_count(max_count)
                .tag_specifications(
                    TagSpecification::builder()
                        .resource_type(ResourceType::Instance)
                        .tags(Tag::builder().key("Name").value(&template.name_tag).build())
                        .build(),
                )
                .dry_run(dry_run);
            self.call("run_instances", request.send())
        })
        .await?;

        let launched: Vec<ObservedInstance> =
            output.instances().iter().filter_map(observed_from_sdk).collect();

        info!(
            requested = count,
            launched = launched.len(),
            "Launched instances"
        );
        Ok(launched)
    }

    #[instrument(skip(self, filter), fields(region = %self.region))]
    async fn describe(&self, filter: &DescribeFilter) -> ProviderResult<Vec<Reservation>> {
        let states: Vec<String> = filter
            .states
            .iter()
            .map(|state| state.as_str().to_string())
            .collect();
        let filters = vec![
            Filter::builder()
                .name("image-id")
                .values(&filter.image_id)
                .build(),
            Filter::builder()
                .name("tag:aws:ec2launchtemplate:id")
                .values(&filter.launch_template_id)
                .build(),
            Filter::builder()
                .name("instance-state-name")
                .set_values(Some(states))
                .build(),
        ];

        let mut reservations = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let request = self
                .client
                .describe_instances()
                .set_filters(Some(filters.clone()))
                .set_next_token(next_token.take());
            let page = self.call("describe_instances", request.send()).await?;

            reservations.extend(page.reservations().iter().map(|reservation| Reservation {
                instances: reservation
                    .instances()
                    .iter()
                    .filter_map(observed_from_sdk)
                    .collect(),
            }));

            match page.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(reservations = reservations.len(), "Described instances");
        Ok(reservations)
    }

    #[instrument(skip(self, ids), fields(region = %self.region, count = ids.len()))]
    async fn stop(&self, ids: &[ProviderInstanceId]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let instance_ids = raw_ids(ids);

        with_dry_run_probe("stop_instances", self.settings.dry_run_probe, |dry_run| {
            let request = self
                .client
                .stop_instances()
                .set_instance_ids(Some(instance_ids.clone()))
                .dry_run(dry_run);
            self.call("stop_instances", request.send())
        })
        .await?;

        info!(instance_ids = ?instance_ids, "Stopped instances");
        Ok(())
    }

    #[instrument(skip(self, ids), fields(region = %self.region, count = ids.len()))]
    async fn terminate(&self, ids: &[ProviderInstanceId]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let instance_ids = raw_ids(ids);

        match self.terminate_batch(&instance_ids).await {
            // One unknown id fails the whole batch; retry the rest one by one.
            Err(e) if e.is_not_found() && instance_ids.len() > 1 => {
                warn!(error = %e, "Batch terminate hit unknown ids, retrying individually");
                for id in &instance_ids {
                    match self.terminate_batch(std::slice::from_ref(id)).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {
                            debug!(instance_id = %id, "Instance already gone")
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.is_not_found() => {
                debug!(instance_ids = ?instance_ids, "Instance already gone");
            }
            other => other?,
        }

        info!(instance_ids = ?instance_ids, "Terminated instances");
        Ok(())
    }
}

fn raw_ids(ids: &[ProviderInstanceId]) -> Vec<String> {
    ids.iter().map(|id| id.as_str().to_string()).collect()
}

fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: fmt::Debug,
{
    if let Some(service) = err.as_service_error() {
        if let Some(code) = service.code() {
            return ProviderError::Rejected {
                operation,
                code: code.to_string(),
                message: service.message().unwrap_or_default().to_string(),
            };
        }
    }
    ProviderError::Transport {
        operation,
        message: DisplayErrorContext(&err).to_string(),
    }
}

fn observed_from_sdk(instance: &Instance) -> Option<ObservedInstance> {
    let Some(raw_id) = instance.instance_id() else {
        warn!("Provider returned an instance without an id");
        return None;
    };
    let provider_id = match raw_id.parse::<ProviderInstanceId>() {
        Ok(id) => id,
        Err(e) => {
            warn!(instance_id = raw_id, error = %e, "Skipping instance with unusable id");
            return None;
        }
    };

    let state = instance
        .state()
        .and_then(|state| state.name())
        .map(|name| ProviderState::from_name(name.as_str()))
        .unwrap_or(ProviderState::Unknown);

    let launched_at = instance
        .launch_time()
        .and_then(|at| DateTime::<Utc>::from_timestamp(at.secs(), at.subsec_nanos()));

    Some(ObservedInstance {
        provider_id,
        state,
        public_address: instance.public_ip_address().map(str::to_string),
        launched_at,
    })
}

//! ConfigMap rendering

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::options::{validate_dns_subdomain, ConfigMapOption, ConfigMapOptions};
use crate::Error;

pub(crate) const MAX_CONFIG_MAP_NAME_LEN: usize = 253;

/// Render a ConfigMap from an ordered list of options
pub fn build_config_map(
    options: impl IntoIterator<Item = ConfigMapOption>,
) -> Result<ConfigMap, Error> {
    let mut opts = ConfigMapOptions::default();
    for option in options {
        option.apply(&mut opts)?;
    }

    validate_dns_subdomain("ConfigMap", &opts.name, MAX_CONFIG_MAP_NAME_LEN)?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(opts.name),
            namespace: Some(opts.namespace),
            labels: (!opts.labels.is_empty()).then_some(opts.labels),
            owner_references: (!opts.owner_references.is_empty())
                .then_some(opts.owner_references),
            ..Default::default()
        },
        data: Some(opts.data),
        ..Default::default()
    })
}

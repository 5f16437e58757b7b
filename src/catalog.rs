use {
    crate::{
        client::ConsulClient,
        error::Error,
        query::{BlockingQueryOptions, Indexed},
    },
    serde::{Deserialize, Serialize},
    std::collections::BTreeMap,
};

///
/// One service known to the catalog, with its registered tags.
///
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub tags: Vec<String>,
}

///
/// Description of a service instance, as carried by service transaction
/// operations and returned in their result entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOptions {
    #[serde(rename = "ID", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "Service")]
    pub service: String,

    #[serde(rename = "Tags", default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(rename = "Address", default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(rename = "Port", default)]
    pub port: u16,
}

impl ConsulClient {
    /// Lists the services the catalog knows about. The wire shape is a map
    /// of service name to tag list; it is flattened here into a stable,
    /// name-ordered list.
    pub async fn catalog_services(
        &self,
        options: Option<BlockingQueryOptions>,
    ) -> Result<Indexed<Vec<Service>>, Error> {
        let indexed = self
            .get_indexed::<BTreeMap<String, Vec<String>>>(
                "/v1/catalog/services",
                options.unwrap_or_default(),
                &[],
            )
            .await?;
        let list = indexed
            .value
            .unwrap_or_default()
            .into_iter()
            .map(|(name, tags)| Service { name, tags })
            .collect();
        Ok(Indexed::new(list, indexed.index))
    }
}

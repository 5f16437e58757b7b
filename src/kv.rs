use {
    crate::{
        client::ConsulClient,
        error::Error,
        query::{BlockingQueryOptions, Indexed},
        ChangeIndex,
    },
    serde::{Deserialize, Serialize},
};

/// Base64 codec for nullable value fields: the agent base64-encodes every
/// value on the wire and sends `null` where no value exists.
pub(crate) mod base64_value {
    use {
        base64::{engine::general_purpose::STANDARD, Engine as _},
        serde::{Deserialize, Deserializer, Serializer},
    };

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => ser.serialize_str(&STANDARD.encode(bytes)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(de)?;
        raw.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

///
/// One entry of the key/value store.
///
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(rename = "Key")]
    pub key: String,

    /// Raw value bytes. `None` when the agent reports no value, e.g. in the
    /// write echoes of a transaction response.
    #[serde(rename = "Value", with = "base64_value", default)]
    pub value: Option<Vec<u8>>,

    #[serde(rename = "Flags", default)]
    pub flags: u64,

    #[serde(rename = "CreateIndex", default)]
    pub create_index: ChangeIndex,

    #[serde(rename = "ModifyIndex", default)]
    pub modify_index: ChangeIndex,

    #[serde(rename = "LockIndex", default)]
    pub lock_index: u64,

    #[serde(rename = "Session", default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

///
/// Write options for [`ConsulClient::kv_put_with_options`].
///
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyValueOptions {
    /// Opaque per-entry flags, stored verbatim by the agent.
    pub flags: u64,
    /// Check-and-set barrier: the write only applies if the entry's current
    /// modify index matches. Zero means "only if the key does not exist yet".
    pub cas: Option<ChangeIndex>,
}

impl ConsulClient {
    /// Reads a single key. The agent answers with a one-element list; an
    /// absent key is `None`, still carrying the change index needed to watch
    /// for its creation.
    pub async fn kv_get(
        &self,
        key: &str,
        options: Option<BlockingQueryOptions>,
    ) -> Result<Indexed<Option<KeyValue>>, Error> {
        let indexed = self
            .get_indexed::<Vec<KeyValue>>(&kv_path(key), options.unwrap_or_default(), &[])
            .await?;
        let value = indexed.value.and_then(|list| list.into_iter().next());
        Ok(Indexed::new(value, indexed.index))
    }

    /// Reads every key under a prefix. An empty tree is an empty list.
    pub async fn kv_get_tree(
        &self,
        prefix: &str,
        options: Option<BlockingQueryOptions>,
    ) -> Result<Indexed<Vec<KeyValue>>, Error> {
        let recurse = [("recurse", "true".to_string())];
        let indexed = self
            .get_indexed::<Vec<KeyValue>>(&kv_path(prefix), options.unwrap_or_default(), &recurse)
            .await?;
        Ok(Indexed::new(
            indexed.value.unwrap_or_default(),
            indexed.index,
        ))
    }

    pub async fn kv_put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<bool, Error> {
        self.kv_put_with_options(key, value, KeyValueOptions::default())
            .await
    }

    /// Writes a key. Returns `false` when a `cas` barrier rejected the write.
    pub async fn kv_put_with_options(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        options: KeyValueOptions,
    ) -> Result<bool, Error> {
        let mut query = Vec::new();
        if options.flags > 0 {
            query.push(("flags", options.flags.to_string()));
        }
        if let Some(cas) = options.cas {
            query.push(("cas", cas.to_string()));
        }
        self.put_bool(&kv_path(key), &query, value.into()).await
    }

    pub async fn kv_delete(&self, key: &str) -> Result<(), Error> {
        self.delete(&kv_path(key), &[]).await
    }

    pub async fn kv_delete_tree(&self, prefix: &str) -> Result<(), Error> {
        let recurse = [("recurse", "true".to_string())];
        self.delete(&kv_path(prefix), &recurse).await
    }
}

fn kv_path(key: &str) -> String {
    format!("/v1/kv/{key}")
}

use thiserror::Error;

/// Failures while wiring the process: settings that cannot reach a store,
/// logging setup, and writing results.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("store.url is required; set it in sitecms.toml, SITECMS__STORE__URL or --store-url")]
    MissingStoreUrl,
    #[error("invalid store url `{url}`: {source}")]
    InvalidStoreUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("store api key is not a valid header value")]
    InvalidApiKey,
    #[error("failed to build store client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_url_errors_name_the_url() {
        let source = url::Url::parse("not a url").expect_err("relative url");
        let err = InfraError::InvalidStoreUrl {
            url: "not a url".to_string(),
            source,
        };
        assert!(err.to_string().starts_with("invalid store url `not a url`: "));
    }
}

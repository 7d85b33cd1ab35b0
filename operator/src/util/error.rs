#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Watch error: {source}")]
    Watch {
        #[from]
        source: kube::runtime::watcher::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    #[error("Cloud provider error: {source}")]
    CloudProvider {
        #[from]
        source: crate::cloudprovider::CloudProviderError,
    },
}

use meridian_core::ObjectKey;

/// Handler failures. Collaborator errors are carried unchanged as the source.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading {key} from cache")]
    Cache {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("reconciling {key}")]
    Reconcile {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("updating {key}")]
    Update {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("updating status of {key}")]
    UpdateStatus {
        key: ObjectKey,
        #[source]
        source: anyhow::Error,
    },
    #[error("listing primary resources")]
    List(#[source] anyhow::Error),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Render an error with its whole source chain, `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(e) = cur {
        out.push_str(": ");
        out.push_str(&e.to_string());
        cur = e.source();
    }
    out
}

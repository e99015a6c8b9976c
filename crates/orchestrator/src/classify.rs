//! Error classification.
//!
//! Maps an error (and every cause beneath it) to an [`ErrorKind`] that
//! decides whether a retry boundary may run the failed work again. Matching
//! is structural where a typed error exists and falls back to fixed message
//! substrings otherwise. Anything unrecognised is non-retryable.

use crate::error::OrchestratorError;
use std::error::Error as StdError;
use std::io;

const EBUSY: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientNetwork,
    TransientCluster,
    Cancelled,
    Permanent,
    StreamClosed,
    ResourceBusy,
    FatalConfiguration,
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientNetwork => "transient_network",
            ErrorKind::TransientCluster => "transient_cluster",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Permanent => "permanent",
            ErrorKind::StreamClosed => "stream_closed",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::FatalConfiguration => "fatal_configuration",
            ErrorKind::Unclassified => "unclassified",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientNetwork
                | ErrorKind::TransientCluster
                | ErrorKind::StreamClosed
                | ErrorKind::ResourceBusy
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn classify(err: &OrchestratorError) -> ErrorKind {
    if is_cancelled(err) {
        ErrorKind::Cancelled
    } else if is_permanent(err) {
        ErrorKind::Permanent
    } else if is_fatal_configuration(err) {
        ErrorKind::FatalConfiguration
    } else if is_cluster_unavailable(err) {
        ErrorKind::TransientCluster
    } else if is_stream_closed(err) {
        ErrorKind::StreamClosed
    } else if is_connection_problem(err) {
        ErrorKind::TransientNetwork
    } else if is_resource_busy(err) {
        ErrorKind::ResourceBusy
    } else {
        ErrorKind::Unclassified
    }
}

/// Wraps errors that reconnecting to a peer can never fix in
/// [`OrchestratorError::Permanent`] so a backoff loop stops immediately.
pub fn should_reconnect_peer(err: OrchestratorError) -> OrchestratorError {
    if matches!(err, OrchestratorError::Permanent(_)) {
        return err;
    }
    let message = err.to_string();
    if is_peer_denied(&message) || is_license_error(&message) || is_host_already_registered(&message)
    {
        return OrchestratorError::Permanent(Box::new(err));
    }
    err
}

/// Cancellation either directly or as the cause of a connection problem.
pub fn is_cancelled(err: &OrchestratorError) -> bool {
    orchestrator_errors(err).any(|e| matches!(e, OrchestratorError::Cancelled))
}

pub fn is_permanent(err: &OrchestratorError) -> bool {
    orchestrator_errors(err).any(|e| {
        matches!(
            e,
            OrchestratorError::Permanent(_) | OrchestratorError::AccessDenied(_)
        )
    }) || messages(err).any(|m| is_peer_denied(&m) || is_license_error(&m) || is_host_already_registered(&m))
}

pub fn is_fatal_configuration(err: &OrchestratorError) -> bool {
    orchestrator_errors(err).any(|e| {
        matches!(
            e,
            OrchestratorError::UnknownPhase(_)
                | OrchestratorError::BadParameter(_)
                | OrchestratorError::MalformedPlan(_)
        )
    })
}

pub fn is_cluster_unavailable(err: &OrchestratorError) -> bool {
    let structured = orchestrator_errors(err).any(|e| {
        matches!(
            e,
            OrchestratorError::Kubernetes {
                status: 429 | 503 | 504,
                ..
            }
        )
    });
    structured || messages(err).any(|m| is_etcd_cluster_message(&m))
}

pub fn is_stream_closed(err: &OrchestratorError) -> bool {
    let unexpected_eof = causes(err)
        .filter_map(|e| e.downcast_ref::<io::Error>())
        .any(|e| e.kind() == io::ErrorKind::UnexpectedEof);
    unexpected_eof
        || messages(err).any(|m| {
            m.contains("use of closed network connection")
                || m.ends_with("response body closed")
                || m == "EOF"
                || m.ends_with(": EOF")
                || m.contains("unexpected EOF")
        })
}

pub fn is_connection_problem(err: &OrchestratorError) -> bool {
    causes(err).any(|e| {
        if let Some(e) = e.downcast_ref::<OrchestratorError>() {
            if matches!(e, OrchestratorError::ConnectionProblem { .. }) {
                return true;
            }
        }
        if let Some(e) = e.downcast_ref::<reqwest::Error>() {
            if e.is_connect() || e.is_timeout() {
                return true;
            }
        }
        if let Some(e) = e.downcast_ref::<io::Error>() {
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
            ) {
                return true;
            }
        }
        let message = e.to_string();
        message.contains("connection reset by peer") || message.contains("connection refused")
    })
}

pub fn is_resource_busy(err: &OrchestratorError) -> bool {
    causes(err)
        .filter_map(|e| e.downcast_ref::<io::Error>())
        .any(|e| e.raw_os_error() == Some(EBUSY))
        || messages(err).any(|m| m.contains("device or resource busy"))
}

fn causes<'a>(
    err: &'a OrchestratorError,
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> + 'a {
    let root: &'a (dyn StdError + 'static) = err;
    std::iter::successors(Some(root), |e: &&'a (dyn StdError + 'static)| (*e).source())
}

fn orchestrator_errors<'a>(
    err: &'a OrchestratorError,
) -> impl Iterator<Item = &'a OrchestratorError> + 'a {
    causes(err).filter_map(|e| e.downcast_ref::<OrchestratorError>())
}

fn messages<'a>(err: &'a OrchestratorError) -> impl Iterator<Item = String> + 'a {
    causes(err).map(|e| match e.downcast_ref::<OrchestratorError>() {
        Some(OrchestratorError::Kubernetes { message, .. }) => message.clone(),
        Some(OrchestratorError::Remote(message)) => message.clone(),
        _ => e.to_string(),
    })
}

fn is_etcd_cluster_message(message: &str) -> bool {
    message.contains("etcd cluster is unavailable or misconfigured")
        || (message.contains("etcd member") && message.contains("has no leader"))
}

fn is_peer_denied(message: &str) -> bool {
    message.contains("peer not authorized")
}

fn is_license_error(message: &str) -> bool {
    message.contains("license allows maximum of")
}

fn is_host_already_registered(message: &str) -> bool {
    message.contains("One of existing peers already has hostname")
        || message.contains("One of existing servers already has hostname")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etcd_unavailable_is_transient_cluster() {
        let err = OrchestratorError::phase_failed(
            "/openebs",
            OrchestratorError::Kubernetes {
                status: 500,
                message: "etcd cluster is unavailable or misconfigured".to_string(),
            },
        );
        assert_eq!(classify(&err), ErrorKind::TransientCluster);
        assert!(classify(&err).is_retryable());

        let err = OrchestratorError::Remote("etcd member 10.0.0.5:2379 has no leader".to_string());
        assert_eq!(classify(&err), ErrorKind::TransientCluster);
    }

    #[test]
    fn test_peer_not_authorized_is_permanent() {
        let err = OrchestratorError::Remote("peer not authorized".to_string());
        assert_eq!(classify(&err), ErrorKind::Permanent);
        assert!(!classify(&err).is_retryable());

        let gated = should_reconnect_peer(err);
        assert!(matches!(gated, OrchestratorError::Permanent(_)));
        assert_eq!(classify(&gated), ErrorKind::Permanent);

        // Already-marked errors are not wrapped twice.
        match should_reconnect_peer(gated) {
            OrchestratorError::Permanent(inner) => {
                assert!(matches!(*inner, OrchestratorError::Remote(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_should_reconnect_peer_passes_transient_errors() {
        let err = should_reconnect_peer(OrchestratorError::connection_problem(
            "10.0.0.5",
            "connection refused",
        ));
        assert!(matches!(err, OrchestratorError::ConnectionProblem { .. }));

        let err = should_reconnect_peer(OrchestratorError::Remote(
            "license allows maximum of 3 nodes".to_string(),
        ));
        assert!(matches!(err, OrchestratorError::Permanent(_)));

        let err = should_reconnect_peer(OrchestratorError::Remote(
            "One of existing servers already has hostname \"node-1\"".to_string(),
        ));
        assert!(matches!(err, OrchestratorError::Permanent(_)));
    }

    #[test]
    fn test_cancelled() {
        assert_eq!(classify(&OrchestratorError::Cancelled), ErrorKind::Cancelled);

        let wrapped = OrchestratorError::ConnectionProblem {
            peer: "10.0.0.5".to_string(),
            message: "call aborted".to_string(),
            source: Some(Box::new(OrchestratorError::Cancelled)),
        };
        assert_eq!(classify(&wrapped), ErrorKind::Cancelled);
    }

    #[test]
    fn test_network_errors() {
        let err = OrchestratorError::connection_problem("10.0.0.5", "agent went away");
        assert_eq!(classify(&err), ErrorKind::TransientNetwork);

        let err = OrchestratorError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "dial tcp 10.0.0.5:3009",
        ));
        assert_eq!(classify(&err), ErrorKind::TransientNetwork);

        let err = OrchestratorError::Remote("read tcp: connection reset by peer".to_string());
        assert_eq!(classify(&err), ErrorKind::TransientNetwork);
    }

    #[test]
    fn test_stream_closed() {
        let err = OrchestratorError::Remote("http2: response body closed".to_string());
        assert_eq!(classify(&err), ErrorKind::StreamClosed);

        let err = OrchestratorError::Remote("EOF".to_string());
        assert_eq!(classify(&err), ErrorKind::StreamClosed);

        let err = OrchestratorError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
        assert_eq!(classify(&err), ErrorKind::StreamClosed);
    }

    #[test]
    fn test_resource_busy() {
        let err = OrchestratorError::Io(io::Error::from_raw_os_error(EBUSY));
        assert_eq!(classify(&err), ErrorKind::ResourceBusy);
        assert!(classify(&err).is_retryable());
    }

    #[test]
    fn test_fatal_and_unclassified() {
        let err = OrchestratorError::UnknownPhase("/bogus/1".to_string());
        assert_eq!(classify(&err), ErrorKind::FatalConfiguration);

        let err = OrchestratorError::ExecutionFailed("something odd".to_string());
        assert_eq!(classify(&err), ErrorKind::Unclassified);
        assert!(!classify(&err).is_retryable());
    }
}

//! Packaging evaluation failures into [`NodeError`] values.

use super::NodeSignature;
use tickflow_common::{EngineError, NodeError};

/// Capture a user-code failure against the failing node's declaration.
///
/// The frame list starts at the node path and walks up its wiring path, so a
/// nested-graph failure reads innermost-first; `trace_back_depth` bounds how
/// much of that chain survives.
pub fn capture_node_error(
    error: &EngineError,
    signature: &NodeSignature,
    input_snapshot: Option<String>,
) -> NodeError {
    let mut frames = vec![signature.path()];
    let mut path = signature.wiring_path.as_str();
    while !path.is_empty() {
        frames.push(path.to_string());
        path = match path.rfind('.') {
            Some(split) => &path[..split],
            None => "",
        };
    }

    let mut captured = NodeError::new(signature.path(), error.to_string(), error.kind_name())
        .with_frames(frames, signature.trace_back_depth)
        .with_signature(signature.signature());
    if let Some(snapshot) = input_snapshot {
        captured = captured.with_input_snapshot(snapshot);
    }
    captured
}

/// Enrich an uncaptured failure with the node's path and signature before it
/// unwinds the engine.
pub fn enrich_node_error(error: EngineError, signature: &NodeSignature) -> EngineError {
    match error {
        EngineError::Node(mut inner) => {
            if inner.node_path.is_empty() {
                inner.node_path = signature.path();
                inner.signature = signature.signature();
            }
            EngineError::Node(inner)
        }
        other => EngineError::Node(
            NodeError::new(signature.path(), other.to_string(), other.kind_name())
                .with_signature(signature.signature()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeTypeFlags;

    fn signature() -> NodeSignature {
        let mut sig = NodeSignature::new("calc", NodeTypeFlags::COMPUTE);
        sig.wiring_path = "root.pricing".into();
        sig.trace_back_depth = 2;
        sig
    }

    #[test]
    fn capture_bounds_frames() {
        let err = EngineError::internal("boom");
        let captured = capture_node_error(&err, &signature(), None);
        assert_eq!(captured.node_path, "root.pricing.calc");
        assert_eq!(captured.frames.len(), 2);
        assert_eq!(captured.frames[0], "root.pricing.calc");
        assert_eq!(captured.frames[1], "root.pricing");
        assert_eq!(captured.error_kind, "InternalError");
    }

    #[test]
    fn capture_retains_input_snapshot() {
        let err = EngineError::internal("boom");
        let captured = capture_node_error(&err, &signature(), Some("x=1".into()));
        assert_eq!(captured.input_snapshot.as_deref(), Some("x=1"));
        assert!(captured.to_string().contains("x=1"));
    }

    #[test]
    fn enrichment_prepends_path() {
        let err = EngineError::internal("boom");
        let enriched = enrich_node_error(err, &signature());
        assert!(enriched.to_string().contains("root.pricing.calc"));
    }
}

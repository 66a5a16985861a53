use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("out of kv blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("sequence {id} already has a kv entry")]
    DuplicateSequence { id: String },

    #[error("no kv entry for sequence {id}")]
    UnknownSequence { id: String },

    #[error("kv capacity exhausted for sequence {id}: {max_allowed} tokens")]
    CapacityExhausted { id: String, max_allowed: usize },

    #[error("layer {layer} out of range (model has {num_layers} layers)")]
    LayerOutOfRange { layer: usize, num_layers: usize },

    #[error("kv invariant violated: {0}")]
    InvariantViolated(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_out_of_blocks() {
        let e = CacheError::OutOfBlocks {
            requested: 10,
            available: 3,
        };
        assert_eq!(e.to_string(), "out of kv blocks: requested 10, available 3");
    }

    #[test]
    fn error_display_capacity_exhausted() {
        let e = CacheError::CapacityExhausted {
            id: "req-7".to_string(),
            max_allowed: 32,
        };
        assert_eq!(
            e.to_string(),
            "kv capacity exhausted for sequence req-7: 32 tokens"
        );
    }

    #[test]
    fn error_display_duplicate_sequence() {
        let e = CacheError::DuplicateSequence {
            id: "abc".to_string(),
        };
        assert_eq!(e.to_string(), "sequence abc already has a kv entry");
    }
}

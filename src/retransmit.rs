//! Retransmission handle (spec §3 "Retransmission handle", §9 design notes
//! "Callback-based retransmission"): either a raw buffered copy of a
//! message's cleartext body, a deterministic callback that regenerates it
//! from caller-owned context, or a CCS marker carrying no body at all.

use std::any::Any;

/// Regenerates a message body from its owned `context` on each call. Must
/// be deterministic: the flight layer may invoke it more than once for the
/// same retransmission round.
pub type RetransmitFn = Box<dyn Fn(&dyn Any) -> Vec<u8> + Send>;

pub(crate) enum RetransmitHandle {
    /// The user committed the whole body up front; we keep our own copy.
    Raw(Vec<u8>),
    /// The user would rather not buffer a large message twice; we call back
    /// into their code (and their owned context) to regenerate it.
    Callback {
        generate: RetransmitFn,
        context: Box<dyn Any + Send>,
    },
    /// A ChangeCipherSpec: always the single byte `0x01`, no body to store.
    Ccs,
}

impl RetransmitHandle {
    /// The bytes to place on the wire for a (re)transmission, or `None` for
    /// the CCS marker (callers special-case that content type directly).
    pub fn body(&self) -> Option<Vec<u8>> {
        match self {
            RetransmitHandle::Raw(bytes) => Some(bytes.clone()),
            RetransmitHandle::Callback { generate, context } => Some(generate(context.as_ref())),
            RetransmitHandle::Ccs => None,
        }
    }
}

impl std::fmt::Debug for RetransmitHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetransmitHandle::Raw(bytes) => f.debug_tuple("Raw").field(&bytes.len()).finish(),
            RetransmitHandle::Callback { .. } => f.debug_struct("Callback").finish(),
            RetransmitHandle::Ccs => write!(f, "Ccs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_handle_returns_its_stored_bytes() {
        let h = RetransmitHandle::Raw(vec![1, 2, 3]);
        assert_eq!(h.body(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn callback_handle_regenerates_deterministically_from_its_context() {
        let h = RetransmitHandle::Callback {
            generate: Box::new(|ctx: &dyn Any| {
                let n = ctx.downcast_ref::<u32>().copied().unwrap_or(0);
                vec![n as u8; n as usize]
            }),
            context: Box::new(4u32),
        };
        assert_eq!(h.body(), Some(vec![4u8; 4]));
        assert_eq!(h.body(), Some(vec![4u8; 4]));
    }

    #[test]
    fn ccs_handle_has_no_body() {
        assert_eq!(RetransmitHandle::Ccs.body(), None);
    }
}

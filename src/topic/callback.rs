//! Type-erased subscriber callbacks.
//!
//! A subscription is polymorphic over one message type. At registration
//! time the concrete type is captured in a [`TypedCallback`]; afterwards
//! the dispatch path only sees the [`CallbackHandler`] capability: a type
//! name to match against and an `invoke` that decodes and delivers.

use std::marker::PhantomData;

use crate::core::{DecodeError, Message};

/// Capability object stored in a node's callback table.
pub trait CallbackHandler: Send + Sync {
    /// Message type this handler accepts.
    fn msg_type(&self) -> &'static str;

    /// Decode `data` to the handler's message type and deliver it.
    ///
    /// A decode failure is isolated to this handler; the caller logs it
    /// and continues with the remaining handlers.
    fn invoke(&self, data: &[u8]) -> Result<(), DecodeError>;
}

/// A [`CallbackHandler`] wrapping a typed closure.
pub struct TypedCallback<M, F>
where
    M: Message,
    F: Fn(M) + Send + Sync,
{
    cb: F,
    _marker: PhantomData<fn(M)>,
}

impl<M, F> TypedCallback<M, F>
where
    M: Message,
    F: Fn(M) + Send + Sync,
{
    /// Wrap a closure taking the concrete message type.
    pub fn new(cb: F) -> Self {
        Self {
            cb,
            _marker: PhantomData,
        }
    }
}

impl<M, F> CallbackHandler for TypedCallback<M, F>
where
    M: Message,
    F: Fn(M) + Send + Sync,
{
    fn msg_type(&self) -> &'static str {
        M::TYPE_NAME
    }

    fn invoke(&self, data: &[u8]) -> Result<(), DecodeError> {
        let msg = M::decode(data)?;
        (self.cb)(msg);
        Ok(())
    }
}

//! Host objects exposed to JavaScript.
//!
//! Every native class visible from scripts implements [`ExportableObject`]
//! and points at a static [`Descriptor`]. The descriptor decides whether an
//! instance may cross a message port, and how.
//!
//! Clone and transfer functions follow a two-phase contract. Called with
//! `pretest = true` they only report whether the object can be flattened,
//! returning `Ok(None)`; called with `pretest = false` they produce the
//! [`FlattenedData`] the receiving side rebuilds the object from.

use std::any::Any;
use std::rc::Rc;

use crate::error::BinderError;

/// Attribute bits carried by a [`Descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectAttributes(u32);

impl ObjectAttributes {
    pub const NONE: ObjectAttributes = ObjectAttributes(0);
    pub const TRANSFERABLE: ObjectAttributes = ObjectAttributes(1);
    pub const CLONEABLE: ObjectAttributes = ObjectAttributes(1 << 1);
    pub const MESSAGE_PORT: ObjectAttributes = ObjectAttributes(1 << 2);

    pub const fn union(self, other: ObjectAttributes) -> ObjectAttributes {
        ObjectAttributes(self.0 | other.0)
    }

    pub const fn contains(self, other: ObjectAttributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

/// Flattens a host object for delivery through a message port.
pub type FlattenFn =
    fn(&Rc<dyn ExportableObject>, bool) -> Result<Option<Box<dyn FlattenedData>>, BinderError>;

/// Static metadata shared by every instance of a host class.
pub struct Descriptor {
    pub class_name: &'static str,
    pub attributes: ObjectAttributes,
    pub transfer: Option<FlattenFn>,
    pub clone: Option<FlattenFn>,
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("class_name", &self.class_name)
            .field("attributes", &self.attributes)
            .field("transfer", &self.transfer.is_some())
            .field("clone", &self.clone.is_some())
            .finish()
    }
}

impl Descriptor {
    pub fn is_transferable(&self) -> bool {
        self.attributes.contains(ObjectAttributes::TRANSFERABLE) && self.transfer.is_some()
    }

    pub fn is_cloneable(&self) -> bool {
        self.attributes.contains(ObjectAttributes::CLONEABLE) && self.clone.is_some()
    }

    pub fn is_message_port(&self) -> bool {
        self.attributes.contains(ObjectAttributes::MESSAGE_PORT)
    }

    /// Pick the function used to flatten an instance: transfer when the
    /// object is in the transfer list and transferable, clone otherwise.
    pub fn flatten_fn(&self, in_transfer_list: bool) -> Result<FlattenFn, BinderError> {
        if in_transfer_list && self.is_transferable() {
            if let Some(transfer) = self.transfer {
                return Ok(transfer);
            }
        }
        match self.clone {
            Some(clone) if self.is_cloneable() => Ok(clone),
            _ => Err(BinderError::error("Object does not support transfer or clone")),
        }
    }
}

/// Owns everything the receiving side needs to rebuild a host object, and
/// nothing that would require entering the source isolate.
pub trait FlattenedData: Send {
    fn deserialize<'s>(
        self: Box<Self>,
        scope: &mut v8::HandleScope<'s>,
    ) -> Result<v8::Local<'s, v8::Object>, BinderError>;
}

#[doc(hidden)]
pub trait AsAnyRc {
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Any> AsAnyRc for T {
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// A native object reachable from JavaScript.
pub trait ExportableObject: AsAnyRc {
    fn descriptor(&self) -> &'static Descriptor;

    /// Release resources before the runtime goes away. Called once for every
    /// live object when the runtime is disposed.
    fn dispose(&self) {}
}

/// Downcast a host object to its concrete type.
pub fn downcast<T: ExportableObject + 'static>(object: Rc<dyn ExportableObject>) -> Option<Rc<T>> {
    object.as_any_rc().downcast::<T>().ok()
}

//! # Polymorphic Value Codec
//!
//! Every transport ships opaque blobs; this module is what makes those blobs
//! meaningful. A user value is converted into a self-describing *document* (a
//! JSON value) on the way out and reconstructed on the way in, so that
//! publishers and subscribers on different transports, and even different
//! processes, observe equivalent application-level values.
//!
//! ## Document representation
//!
//! - Primitives (booleans, integers, floats, strings) pass through unchanged.
//! - Sequences and mappings recurse element-wise.
//! - Sets serialize as sequences and deduplicate on decode; fixed-arity
//!   tuples fill positionally.
//! - Named records serialize as mappings and gain a `"__type"` tag carrying
//!   the record's canonical type name.
//! - Sequences of records are wrapped as `{"__list": [...], "__type": ...}`
//!   where the tag names the *element* type.
//! - A `{"__obj": ..., "__type": ...}` wrapping is accepted on decode for
//!   compatibility with foreign peers that tag non-mapping shapes.
//!
//! Tags are advisory: a typed [`Document::decode`] strips them and relies on
//! the statically requested type. They matter for untyped receivers (pattern
//! subscribers, foreign processes), which can consult [`Document::type_tag`]
//! or use [`decode_any`] together with the process-wide type registry.
//!
//! ## Type names and the registry
//!
//! [`fullname`] derives a canonical, dot-separated name for a type
//! (`my_app.events.SimpleEvent`), used both as the `__type` tag and as the
//! default channel name for typed publish/subscribe. Where wire names must
//! stay stable across refactors, or match a peer written in another
//! language, [`register_type_as`] pins a logical name for a type; the
//! registered decoder also makes the type reconstructible by name through
//! [`decode_any`]. Unknown names degrade to the generic document
//! representation instead of failing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CodecError;

/// Key under which a document's type name is embedded.
pub const TYPE_TAG: &str = "__type";
/// Key wrapping a sequence of records; the sibling `__type` names the element.
pub const LIST_TAG: &str = "__list";
/// Key wrapping a non-mapping document that still carries a type tag.
pub const OBJ_TAG: &str = "__obj";

/// A self-describing wire document.
///
/// `Document` is the unit every transport moves around: requests, responses,
/// published events and queue items are all documents. It is a thin wrapper
/// over a JSON value so adapters can serialize it with plain `serde_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Value);

impl Document {
    /// Encode a value into its document representation, tagging it with the
    /// canonical type name where the shape calls for it.
    pub fn encode<T: Serialize + 'static>(value: &T) -> Result<Document, CodecError> {
        let doc = serde_json::to_value(value).map_err(CodecError::Encode)?;
        Ok(Document(tag_value(doc, fullname::<T>())))
    }

    /// Reconstruct a value of type `T` from this document.
    ///
    /// Embedded tags are stripped before deserialization, so a document that
    /// was tagged for an untyped receiver still decodes cleanly into the
    /// concrete type. Decoding a sequence into a set removes duplicates, and
    /// decoding a sequence into a tuple fills fields positionally, per the
    /// serde data model.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let doc = strip_tags(self.0.clone());
        serde_json::from_value(doc).map_err(|source| CodecError::Decode {
            target: std::any::type_name::<T>(),
            source,
        })
    }

    /// The embedded type tag, if this document carries one.
    pub fn type_tag(&self) -> Option<&str> {
        self.0
            .as_object()
            .and_then(|map| map.get(TYPE_TAG))
            .and_then(Value::as_str)
    }

    /// Whether the document is a tagged sequence of records.
    pub fn is_list(&self) -> bool {
        self.0
            .as_object()
            .map(|map| map.contains_key(LIST_TAG))
            .unwrap_or(false)
    }

    /// Borrow the raw JSON value, tags included.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Unwrap into the raw JSON value, tags included.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        Document(value)
    }
}

/// Apply the tagging rules to a freshly serialized value.
fn tag_value(doc: Value, name: String) -> Value {
    match doc {
        Value::Object(mut map) => {
            map.insert(TYPE_TAG.to_string(), Value::String(name));
            Value::Object(map)
        }
        Value::Array(items) => {
            // Only homogeneous record sequences get the list wrapping; the
            // element name comes from the container's generic parameter.
            let all_records = !items.is_empty() && items.iter().all(Value::is_object);
            match element_name(&name) {
                Some(elem) if all_records => {
                    let mut map = Map::new();
                    map.insert(LIST_TAG.to_string(), Value::Array(items));
                    map.insert(TYPE_TAG.to_string(), Value::String(resolve_alias(elem)));
                    Value::Object(map)
                }
                _ => Value::Array(items),
            }
        }
        primitive => primitive,
    }
}

/// Remove the self-description layer so serde sees the plain shape.
fn strip_tags(doc: Value) -> Value {
    match doc {
        Value::Object(mut map) => {
            if let Some(inner) = map.remove(OBJ_TAG) {
                return inner;
            }
            if let Some(inner) = map.remove(LIST_TAG) {
                return inner;
            }
            map.remove(TYPE_TAG);
            Value::Object(map)
        }
        other => other,
    }
}

/// Extract the element type from a generic container name,
/// e.g. `std.vec.Vec<demo.Rec>` yields `demo.Rec`.
fn element_name(name: &str) -> Option<&str> {
    let start = name.find('<')?;
    let end = name.rfind('>')?;
    if start + 1 >= end {
        return None;
    }
    Some(&name[start + 1..end])
}

/// The canonical, dot-separated name of a type.
///
/// Defaults to the normalized compiler path of `T`
/// (`omnibus::rpc::RpcRequest` becomes `omnibus.rpc.RpcRequest`); a logical
/// name pinned via [`register_type_as`] takes precedence. Function item
/// types resolve to the function's path, which is what gives remote
/// functions their default channel names.
pub fn fullname<T: ?Sized + 'static>() -> String {
    if let Some(name) = registry().read().names.get(&TypeId::of::<T>()) {
        return name.clone();
    }
    normalize_type_name(std::any::type_name::<T>())
}

fn normalize_type_name(raw: &str) -> String {
    raw.replace("::", ".")
}

type DynDecoder = Box<dyn Fn(&Document) -> Result<Box<dyn Any + Send>, CodecError> + Send + Sync>;

struct RegisteredType {
    decode_one: DynDecoder,
    decode_list: DynDecoder,
}

#[derive(Default)]
struct TypeRegistry {
    names: HashMap<TypeId, String>,
    /// Derived compiler-path name to pinned logical name, for resolving
    /// element types that appear only inside a container's generic name.
    aliases: HashMap<String, String>,
    decoders: HashMap<String, RegisteredType>,
}

/// Map a derived type path to its pinned logical name, if one exists.
fn resolve_alias(name: &str) -> String {
    registry()
        .read()
        .aliases
        .get(name)
        .cloned()
        .unwrap_or_else(|| name.to_string())
}

fn registry() -> &'static RwLock<TypeRegistry> {
    static REGISTRY: OnceLock<RwLock<TypeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(TypeRegistry::default()))
}

/// Register `T` in the process-wide type registry under its derived
/// [`fullname`], making it reconstructible by name through [`decode_any`].
pub fn register_type<T>()
where
    T: DeserializeOwned + Send + 'static,
{
    let name = fullname::<T>();
    insert_decoders::<T>(name);
}

/// Register `T` under an explicit logical name.
///
/// The name becomes both the `__type` tag written by [`Document::encode`]
/// and the default channel name for typed publish/subscribe of `T`. Use
/// this when wire names must survive refactors or match a foreign peer.
pub fn register_type_as<T>(name: &str)
where
    T: DeserializeOwned + Send + 'static,
{
    {
        let mut reg = registry().write();
        reg.names.insert(TypeId::of::<T>(), name.to_string());
        reg.aliases.insert(
            normalize_type_name(std::any::type_name::<T>()),
            name.to_string(),
        );
    }
    insert_decoders::<T>(name.to_string());
}

fn insert_decoders<T>(name: String)
where
    T: DeserializeOwned + Send + 'static,
{
    let entry = RegisteredType {
        decode_one: Box::new(|doc| Ok(Box::new(doc.decode::<T>()?) as Box<dyn Any + Send>)),
        decode_list: Box::new(|doc| Ok(Box::new(doc.decode::<Vec<T>>()?) as Box<dyn Any + Send>)),
    };
    registry().write().decoders.insert(name, entry);
}

/// A value decoded without a statically known target type.
pub enum AnyValue {
    /// The document's type tag named a registered type; the box holds the
    /// reconstructed value (or a `Vec` of it for list documents).
    Typed(Box<dyn Any + Send>),
    /// No usable tag, or the tag named an unregistered type: the generic
    /// document representation is handed through unchanged.
    Document(Document),
}

impl std::fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyValue::Typed(_) => f.debug_tuple("Typed").field(&"..").finish(),
            AnyValue::Document(doc) => f.debug_tuple("Document").field(doc).finish(),
        }
    }
}

impl AnyValue {
    /// Attempt to take the value as a concrete `T`.
    pub fn downcast<T: 'static>(self) -> Result<T, AnyValue> {
        match self {
            AnyValue::Typed(boxed) => boxed
                .downcast::<T>()
                .map(|b| *b)
                .map_err(|b| AnyValue::Typed(b)),
            doc => Err(doc),
        }
    }
}

/// Decode a document whose target type is only known from its embedded tag.
///
/// Looks up the `__type` tag in the process-wide registry; list documents
/// reconstruct as a `Vec` of the element type. Untagged documents and
/// unknown names yield [`AnyValue::Document`].
pub fn decode_any(doc: &Document) -> Result<AnyValue, CodecError> {
    let Some(tag) = doc.type_tag() else {
        return Ok(AnyValue::Document(doc.clone()));
    };
    let reg = registry().read();
    let Some(entry) = reg.decoders.get(tag) else {
        return Ok(AnyValue::Document(doc.clone()));
    };
    let decoder = if doc.is_list() {
        &entry.decode_list
    } else {
        &entry.decode_one
    };
    Ok(AnyValue::Typed(decoder(doc)?))
}

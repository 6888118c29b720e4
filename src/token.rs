//! Type identity handles and check-site descriptors
//!
//! The instrumentation layer hands the engine an opaque handle per runtime
//! type. Handles compare by address, like the class objects they stand in
//! for: two tokens are the same type if and only if they are the same
//! allocation. This keeps the monomorphic fast path down to a single pointer
//! comparison and makes every map key a small `Copy` value.

use std::any::TypeId;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::OnceLock;

use dashmap::DashMap;
use fnv::FnvBuildHasher;
use serde::Serialize;

/// Identity handle for a runtime type.
///
/// Equality and hashing use the token's address, never its name: `type_name`
/// output is not guaranteed unique, addresses of interned tokens are.
/// Instrumented code should obtain tokens through [`of`] (one leaked token
/// per `TypeId`, interned on first use) or hold its own `static` tokens.
#[derive(Debug)]
pub struct TypeToken {
    name: &'static str,
}

impl TypeToken {
    /// Create a token with the given display name.
    ///
    /// Callers are responsible for using one allocation per type; a second
    /// token with the same name is a *different* type as far as the engine
    /// is concerned.
    pub const fn new(name: &'static str) -> Self {
        TypeToken { name }
    }

    /// Human-readable type name for reports.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeToken {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self, other)
    }
}

impl Eq for TypeToken {}

impl Hash for TypeToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self as *const TypeToken as usize).hash(state);
    }
}

/// Interned token for the static type `T`, one allocation per `TypeId`.
///
/// The table is append-only and process-wide; tokens are leaked so that the
/// `&'static` identity contract holds for the process lifetime.
pub fn of<T: ?Sized + 'static>() -> &'static TypeToken {
    static INTERNED: OnceLock<DashMap<TypeId, &'static TypeToken, FnvBuildHasher>> =
        OnceLock::new();
    let table = INTERNED.get_or_init(|| DashMap::with_hasher(FnvBuildHasher::default()));
    if let Some(token) = table.get(&TypeId::of::<T>()) {
        return *token;
    }
    *table
        .entry(TypeId::of::<T>())
        .or_insert_with(|| &*Box::leak(Box::new(TypeToken::new(std::any::type_name::<T>()))))
}

/// Flavor of type-check expression a call site was rewritten from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CheckKind {
    /// An `instanceof`-style runtime check.
    InstanceCheck,
    /// An explicit downcast/checkcast.
    Cast,
    /// A type-to-type assignability query.
    Assignability,
}

impl CheckKind {
    /// Short label used in text reports.
    pub fn label(self) -> &'static str {
        match self {
            CheckKind::InstanceCheck => "instancecheck",
            CheckKind::Cast => "cast",
            CheckKind::Assignability => "assignable",
        }
    }
}

/// A single instrumented check site: source location plus check flavor.
///
/// Locations are `&'static str` literals emitted by the instrumentation
/// rewriter. Two sites are the same when both the location text and the
/// check kind match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSite {
    /// Source-location label, e.g. `"src/dispatch.rs:184"`.
    pub location: &'static str,
    /// Kind of check expression at this location.
    pub kind: CheckKind,
}

impl CallSite {
    pub const fn new(location: &'static str, kind: CheckKind) -> Self {
        CallSite { location, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_token_identity_not_name_equality() {
        static A: TypeToken = TypeToken::new("same-name");
        static B: TypeToken = TypeToken::new("same-name");
        assert_eq!(A, A);
        assert_ne!(A, B);
        assert_ne!(hash_of(&A), hash_of(&B));
    }

    #[test]
    fn test_interned_token_is_stable() {
        let first = of::<Vec<u8>>();
        let second = of::<Vec<u8>>();
        assert!(ptr::eq(first, second));
        assert!(first.name().contains("Vec"));
    }

    #[test]
    fn test_interned_tokens_distinguish_types() {
        assert_ne!(of::<u32>(), of::<u64>());
    }

    #[test]
    fn test_call_site_equality_includes_kind() {
        let a = CallSite::new("src/lib.rs:1", CheckKind::Cast);
        let b = CallSite::new("src/lib.rs:1", CheckKind::InstanceCheck);
        let c = CallSite::new("src/lib.rs:1", CheckKind::Cast);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_check_kind_labels() {
        assert_eq!(CheckKind::InstanceCheck.label(), "instancecheck");
        assert_eq!(CheckKind::Cast.label(), "cast");
        assert_eq!(CheckKind::Assignability.label(), "assignable");
    }
}

//! Method interception for plain callables.
//!
//! Wrapping an invocable in an [`InterceptableCallable`] routes every call
//! through the hub's method-interceptor table before the original runs. The
//! registration key is a stable [`TypeIdentity`] token plus a method name;
//! tokens carry an explicit lineage, so an interceptor registered against an
//! ancestor token matches calls on every descendant, consulted after the
//! descendant's own interceptors.
//!
//! Interceptors never observe the original's return value: the first one
//! returning `Some` short-circuits the call, and `None` means pass through.

use std::{any::Any, sync::Arc};

use crate::hub::HubHandle;

/// A stable type-identity token with its ancestry, most specific first in
/// [`TypeIdentity::chain`]. Lineage is declared, not reflected, so identity
/// is meaningful across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeIdentity {
    /// The token of the type itself.
    pub token: &'static str,
    /// Ancestor tokens, nearest first.
    pub lineage: &'static [&'static str],
}

impl TypeIdentity {
    /// An identity with no ancestors.
    pub const fn root(token: &'static str) -> Self {
        Self { token, lineage: &[] }
    }

    /// An identity beneath the given ancestor chain (nearest first).
    pub const fn derived(token: &'static str, lineage: &'static [&'static str]) -> Self {
        Self { token, lineage }
    }

    /// The full consultation chain: the token itself, then its ancestors.
    pub fn chain(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(1 + self.lineage.len());
        out.push(self.token.to_string());
        out.extend(self.lineage.iter().map(|t| t.to_string()));
        out
    }
}

/// What a method interceptor sees.
pub struct InvocationContext<'a> {
    /// Token of the concrete type the call was made on.
    pub type_token: &'a str,
    /// The method name.
    pub method_name: &'a str,
    /// The receiver, when the callable was bound to one.
    pub instance: Option<&'a (dyn Any + Send + Sync)>,
    /// The call arguments; downcast to the concrete argument type.
    pub args: &'a (dyn Any + Send + Sync),
}

/// A method interceptor body. Returning `Some` short-circuits the call with
/// that value (downcast to the callable's return type at the call site).
pub type MethodInterceptorFn =
    Arc<dyn for<'a> Fn(&InvocationContext<'a>) -> Option<Box<dyn Any + Send>> + Send + Sync>;

/// Names one interceptable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    /// The type token the method belongs to.
    pub type_token: &'static str,
    /// The method name.
    pub method_name: &'static str,
}

/// An invocable wrapped for interception.
///
/// Calls consult the hub for the interceptor chain of
/// `(type identity, method)`, walking the lineage most specific first with
/// descending priority within each type, and fall through to the original
/// when nobody returns a value.
pub struct InterceptableCallable<Args, Ret> {
    identity: TypeIdentity,
    method_name: &'static str,
    instance: Option<Arc<dyn Any + Send + Sync>>,
    original: Arc<dyn Fn(&Args) -> Ret + Send + Sync>,
    hub: HubHandle,
}

impl<Args, Ret> InterceptableCallable<Args, Ret>
where
    Args: Send + Sync + 'static,
    Ret: 'static,
{
    /// Wrap `original` so calls route through `hub`'s interceptor table.
    pub fn new(
        hub: HubHandle,
        identity: TypeIdentity,
        method_name: &'static str,
        original: impl Fn(&Args) -> Ret + Send + Sync + 'static,
    ) -> Self {
        Self {
            identity,
            method_name,
            instance: None,
            original: Arc::new(original),
            hub,
        }
    }

    /// Bind a receiver that interceptors can observe through
    /// [`InvocationContext::instance`].
    pub fn with_instance(mut self, instance: Arc<dyn Any + Send + Sync>) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Invoke through the interceptor chain.
    pub async fn call(&self, args: Args) -> Ret {
        let chain = self
            .hub
            .method_interceptor_chain(&self.identity, self.method_name)
            .await;
        let ctx = InvocationContext {
            type_token: self.identity.token,
            method_name: self.method_name,
            instance: self.instance.as_deref(),
            args: &args,
        };
        for interceptor in chain {
            if let Some(value) = interceptor(&ctx) {
                match value.downcast::<Ret>() {
                    Ok(ret) => return *ret,
                    Err(_) => {
                        tracing::warn!(
                            type_token = self.identity.token,
                            method = self.method_name,
                            "interceptor returned a mismatched type, skipping"
                        );
                    }
                }
            }
        }
        self.invoke_original(&args)
    }

    /// Invoke the wrapped callable directly, bypassing interception.
    pub fn invoke_original(&self, args: &Args) -> Ret {
        (self.original)(args)
    }

    /// Describe the method this callable exposes.
    pub fn describe_method(&self) -> MethodDescriptor {
        MethodDescriptor {
            type_token: self.identity.token,
            method_name: self.method_name,
        }
    }
}

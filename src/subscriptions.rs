//! Subscription and interceptor tables.
//!
//! All three tables keep a flat list ordered by descending priority with
//! ties broken by registration order, so matching preserves dispatch order
//! by construction. Owned and mutated only by the hub worker.

use tokio::sync::mpsc;

use crate::{
    matching::pattern_matches,
    message::{ClientId, InterceptorFn, InterceptorId, Message, SubscriptionId},
    proxy::MethodInterceptorFn,
};

/// Where a subscription delivers.
#[derive(Clone)]
pub enum SubscriberSink {
    /// A bounded queue drained by a local callback task.
    Local(mpsc::Sender<Message>),
    /// A connected peer; deliveries go out as publish frames.
    Remote(ClientId),
}

/// A registered topic subscription.
#[derive(Clone)]
pub struct Subscription {
    /// Handle for unsubscription.
    pub id: SubscriptionId,
    /// The selection pattern (exact or trailing-`*`).
    pub pattern: String,
    /// The participant that owns the subscription.
    pub owner: ClientId,
    /// Higher priorities are delivered to first.
    pub priority: i32,
    seq: u64,
    /// Delivery target.
    pub sink: SubscriberSink,
}

/// Priority-ordered subscription list.
#[derive(Default)]
pub struct SubscriptionTable {
    items: Vec<Subscription>,
    next_seq: u64,
}

impl SubscriptionTable {
    /// Add a subscription, keeping the table ordered.
    pub fn insert(
        &mut self,
        pattern: impl Into<String>,
        priority: i32,
        owner: ClientId,
        sink: SubscriberSink,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push(Subscription {
            id,
            pattern: pattern.into(),
            owner,
            priority,
            seq,
            sink,
        });
        self.items.sort_by_key(|s| (std::cmp::Reverse(s.priority), s.seq));
        id
    }

    /// Remove by id. Returns whether anything was removed.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.items.len();
        self.items.retain(|s| s.id != id);
        before != self.items.len()
    }

    /// Remove everything owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: ClientId) {
        self.items.retain(|s| s.owner != owner);
    }

    /// Subscriptions matching `topic`, in dispatch order.
    pub fn matching<'a>(&'a self, topic: &'a str) -> impl Iterator<Item = &'a Subscription> + 'a {
        self.items.iter().filter(move |s| pattern_matches(&s.pattern, topic))
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Where a message interceptor runs.
#[derive(Clone)]
pub enum InterceptorTarget {
    /// A callable in this process, invoked inline during dispatch.
    Local(InterceptorFn),
    /// A connected peer asked over the wire (intercept-invocation frames).
    Remote(ClientId),
}

/// A registered message interceptor.
#[derive(Clone)]
pub struct MessageInterceptor {
    /// Handle for deregistration.
    pub id: InterceptorId,
    /// The selection pattern.
    pub pattern: String,
    /// The participant that owns the interceptor.
    pub owner: ClientId,
    /// Higher priorities are consulted first.
    pub priority: i32,
    seq: u64,
    /// Where the interceptor runs.
    pub target: InterceptorTarget,
}

/// Priority-ordered message-interceptor list.
#[derive(Default)]
pub struct InterceptorTable {
    items: Vec<MessageInterceptor>,
    next_seq: u64,
}

impl InterceptorTable {
    /// Add an interceptor, keeping the table ordered.
    pub fn insert(
        &mut self,
        pattern: impl Into<String>,
        priority: i32,
        owner: ClientId,
        target: InterceptorTarget,
    ) -> InterceptorId {
        let id = InterceptorId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push(MessageInterceptor {
            id,
            pattern: pattern.into(),
            owner,
            priority,
            seq,
            target,
        });
        self.items.sort_by_key(|i| (std::cmp::Reverse(i.priority), i.seq));
        id
    }

    /// Remove by id. Returns whether anything was removed.
    pub fn remove(&mut self, id: InterceptorId) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        before != self.items.len()
    }

    /// Remove everything owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: ClientId) {
        self.items.retain(|i| i.owner != owner);
    }

    /// Interceptors matching `topic`, in consultation order.
    pub fn matching<'a>(
        &'a self,
        topic: &'a str,
    ) -> impl Iterator<Item = &'a MessageInterceptor> + 'a {
        self.items.iter().filter(move |i| pattern_matches(&i.pattern, topic))
    }
}

/// A registered method interceptor, keyed on (type token, method name).
#[derive(Clone)]
pub struct MethodInterceptor {
    /// Handle for deregistration.
    pub id: InterceptorId,
    /// The stable type-identity token the interceptor was registered for.
    pub type_token: String,
    /// The method name.
    pub method: String,
    /// The participant that owns the interceptor.
    pub owner: ClientId,
    /// Higher priorities are consulted first within a type.
    pub priority: i32,
    seq: u64,
    /// The interceptor body.
    pub handler: MethodInterceptorFn,
}

/// Method-interceptor table.
///
/// Lookup walks a type lineage most-specific-first: interceptors registered
/// against an ancestor token match calls on every descendant, but are
/// consulted after the descendant's own.
#[derive(Default)]
pub struct MethodInterceptorTable {
    items: Vec<MethodInterceptor>,
    next_seq: u64,
}

impl MethodInterceptorTable {
    /// Add an interceptor, keeping the table ordered within its key.
    pub fn insert(
        &mut self,
        type_token: impl Into<String>,
        method: impl Into<String>,
        priority: i32,
        owner: ClientId,
        handler: MethodInterceptorFn,
    ) -> InterceptorId {
        let id = InterceptorId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push(MethodInterceptor {
            id,
            type_token: type_token.into(),
            method: method.into(),
            owner,
            priority,
            seq,
            handler,
        });
        self.items.sort_by_key(|i| (std::cmp::Reverse(i.priority), i.seq));
        id
    }

    /// Remove by id. Returns whether anything was removed.
    pub fn remove(&mut self, id: InterceptorId) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        before != self.items.len()
    }

    /// Remove everything owned by `owner`.
    pub fn remove_owned_by(&mut self, owner: ClientId) {
        self.items.retain(|i| i.owner != owner);
    }

    /// The consultation chain for a call on `lineage[0]` (most specific
    /// token first, ancestors after) invoking `method`.
    pub fn chain(&self, lineage: &[String], method: &str) -> Vec<MethodInterceptorFn> {
        let mut out = Vec::new();
        for token in lineage {
            out.extend(
                self.items
                    .iter()
                    .filter(|i| &i.type_token == token && i.method == method)
                    .map(|i| i.handler.clone()),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::message::Metadata;

    fn local_sink() -> (SubscriberSink, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        (SubscriberSink::Local(tx), rx)
    }

    #[test]
    fn dispatch_order_is_priority_then_registration() {
        let mut table = SubscriptionTable::default();
        let owner = ClientId::new();
        let (sink, _rx1) = local_sink();
        let low = table.insert("/t/*", 1, owner, sink);
        let (sink, _rx2) = local_sink();
        let high = table.insert("/t/*", 10, owner, sink);
        let (sink, _rx3) = local_sink();
        let low_second = table.insert("/t/*", 1, owner, sink);

        let order: Vec<SubscriptionId> = table.matching("/t/x").map(|s| s.id).collect();
        assert_eq!(order, vec![high, low, low_second]);
    }

    #[test]
    fn priority_extremes_tie_break_in_registration_order() {
        let mut table = InterceptorTable::default();
        let owner = ClientId::new();
        let f: InterceptorFn = Arc::new(|_m| None);
        let first = table.insert("/p", i32::MAX, owner, InterceptorTarget::Local(f.clone()));
        let second = table.insert("/p", i32::MAX, owner, InterceptorTarget::Local(f.clone()));
        let last = table.insert("/p", i32::MIN, owner, InterceptorTarget::Local(f));

        let order: Vec<InterceptorId> = table.matching("/p").map(|i| i.id).collect();
        assert_eq!(order, vec![first, second, last]);
    }

    #[test]
    fn method_chain_walks_lineage_most_specific_first() {
        let mut table = MethodInterceptorTable::default();
        let owner = ClientId::new();
        let tag = |s: &'static str| -> MethodInterceptorFn {
            Arc::new(move |_ctx| Some(Box::new(s.to_string())))
        };
        // Low-priority interceptor on the specific type still outranks a
        // high-priority one on the ancestor.
        table.insert("ClassB", "foo", 1, owner, tag("b"));
        table.insert("ClassA", "foo", 100, owner, tag("a"));

        let lineage = vec!["ClassB".to_string(), "ClassA".to_string()];
        let chain = table.chain(&lineage, "foo");
        assert_eq!(chain.len(), 2);
        let args = Metadata::new();
        let ctx = crate::proxy::InvocationContext {
            type_token: "ClassB",
            method_name: "foo",
            instance: None,
            args: &args,
        };
        let first = chain[0](&ctx).unwrap().downcast::<String>().unwrap();
        assert_eq!(*first, "b");
    }
}

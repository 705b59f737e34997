//! Subscribers decide whether a client may join a channel and what it gets
//! on joining.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::auth::SignedUser;
use crate::pipeline::Vars;
use crate::rule::SubscriberConfig;
use crate::stream::ManagedStreamRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscribeStatus {
    Ok,
    NotFound,
    PermissionDenied,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeReply {
    pub presence: bool,
    pub join_leave: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub enum Subscriber {
    Builtin(BuiltinSubscriber),
    ManagedStream(ManagedStreamSubscriber),
    Multiple(MultipleSubscriber),
}

impl Subscriber {
    /// `runner` backs `managedStream` subscribers.
    pub fn from_config(config: &SubscriberConfig, runner: &Arc<ManagedStreamRunner>) -> Self {
        match config {
            SubscriberConfig::Builtin => Subscriber::Builtin(BuiltinSubscriber),
            SubscriberConfig::ManagedStream => {
                Subscriber::ManagedStream(ManagedStreamSubscriber::new(runner.clone()))
            }
            SubscriberConfig::Multiple(c) => Subscriber::Multiple(MultipleSubscriber::new(
                c.subscribers
                    .iter()
                    .map(|s| Subscriber::from_config(s, runner))
                    .collect(),
            )),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Subscriber::Builtin(_) => "builtin",
            Subscriber::ManagedStream(_) => "managedStream",
            Subscriber::Multiple(_) => "multiple",
        }
    }

    pub fn subscribe<'a>(
        &'a self,
        vars: &'a Vars,
        user: &'a SignedUser,
        data: &'a [u8],
    ) -> BoxFuture<'a, (SubscribeReply, SubscribeStatus)> {
        async move {
            match self {
                Subscriber::Builtin(s) => s.subscribe(),
                Subscriber::ManagedStream(s) => s.subscribe(vars),
                Subscriber::Multiple(s) => s.subscribe(vars, user, data).await,
            }
        }
        .boxed()
    }
}

/// Accepts everyone, with presence and join/leave events.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinSubscriber;

impl BuiltinSubscriber {
    fn subscribe(&self) -> (SubscribeReply, SubscribeStatus) {
        (
            SubscribeReply {
                presence: true,
                join_leave: true,
                data: None,
            },
            SubscribeStatus::Ok,
        )
    }
}

/// Hands new subscribers the last full frame of the channel.
#[derive(Debug)]
pub struct ManagedStreamSubscriber {
    runner: Arc<ManagedStreamRunner>,
}

impl ManagedStreamSubscriber {
    pub fn new(runner: Arc<ManagedStreamRunner>) -> Self {
        Self { runner }
    }

    fn subscribe(&self, vars: &Vars) -> (SubscribeReply, SubscribeStatus) {
        let stream = self
            .runner
            .get_or_create_stream(vars.org_id, &vars.scope, &vars.namespace);
        (
            SubscribeReply {
                presence: false,
                join_leave: false,
                data: stream.on_subscribe(&vars.path),
            },
            SubscribeStatus::Ok,
        )
    }
}

#[derive(Debug)]
pub struct MultipleSubscriber {
    subscribers: Vec<Subscriber>,
}

impl MultipleSubscriber {
    pub fn new(subscribers: Vec<Subscriber>) -> Self {
        Self { subscribers }
    }

    async fn subscribe(&self, vars: &Vars, user: &SignedUser, data: &[u8]) -> (SubscribeReply, SubscribeStatus) {
        let mut last = (SubscribeReply::default(), SubscribeStatus::Ok);
        for subscriber in &self.subscribers {
            let (reply, status) = subscriber.subscribe(vars, user, data).await;
            if status != SubscribeStatus::Ok {
                return (reply, status);
            }
            last = (reply, status);
        }
        last
    }
}

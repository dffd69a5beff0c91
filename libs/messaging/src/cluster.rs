//! Cluster Communication Boundary
//!
//! Thin layer mapping cluster member ids to network addresses and
//! delegating to the messaging service. Payload encoding and decoding are
//! supplied by the application; nothing here interprets message contents.
//! Membership itself is decided elsewhere; this module only consumes a
//! lookup view of it.

use crate::address::Address;
use crate::error::{MessagingError, Result};
use crate::service::MessagingService;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identity of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// A known cluster member and its network endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    id: MemberId,
    address: Address,
}

impl Member {
    pub fn new(id: impl Into<MemberId>, address: Address) -> Self {
        Self {
            id: id.into(),
            address,
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

/// Read-only view of cluster membership, provided by the membership
/// subsystem. Lookups must be cheap; they sit on the receive path.
pub trait MembershipLookup: Send + Sync {
    fn member_by_id(&self, id: &MemberId) -> Option<Member>;
    fn member_by_address(&self, address: &Address) -> Option<Member>;
    fn members(&self) -> Vec<Member>;
}

/// In-memory membership view for tests and static deployments
#[derive(Default)]
pub struct StaticMembership {
    members: RwLock<HashMap<MemberId, Member>>,
}

impl StaticMembership {
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            members: RwLock::new(
                members
                    .into_iter()
                    .map(|member| (member.id.clone(), member))
                    .collect(),
            ),
        }
    }

    pub fn add(&self, member: Member) {
        self.members.write().insert(member.id.clone(), member);
    }

    pub fn remove(&self, id: &MemberId) {
        self.members.write().remove(id);
    }
}

impl MembershipLookup for StaticMembership {
    fn member_by_id(&self, id: &MemberId) -> Option<Member> {
        self.members.read().get(id).cloned()
    }

    fn member_by_address(&self, address: &Address) -> Option<Member> {
        self.members
            .read()
            .values()
            .find(|member| member.address() == address)
            .cloned()
    }

    fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }
}

/// Member-addressed communication over the messaging service
#[derive(Clone)]
pub struct ClusterCommunicationService {
    messaging: MessagingService,
    membership: Arc<dyn MembershipLookup>,
}

impl ClusterCommunicationService {
    pub fn new(messaging: MessagingService, membership: Arc<dyn MembershipLookup>) -> Self {
        Self {
            messaging,
            membership,
        }
    }

    fn resolve(&self, to: &MemberId) -> Result<Member> {
        self.membership
            .member_by_id(to)
            .ok_or_else(|| MessagingError::UnknownMember {
                member: to.to_string(),
            })
    }

    /// Request/reply exchange with one member
    pub async fn send<Req, Res, E, D>(
        &self,
        to: &MemberId,
        subject: impl Into<String>,
        request: &Req,
        encode: E,
        decode: D,
        timeout: Duration,
    ) -> Result<Res>
    where
        E: Fn(&Req) -> Vec<u8>,
        D: Fn(&[u8]) -> anyhow::Result<Res>,
    {
        let member = self.resolve(to)?;
        let response = self
            .messaging
            .send_and_receive(
                member.address().clone(),
                subject,
                encode(request),
                true,
                timeout,
            )
            .await?;
        decode(&response)
            .map_err(|e| MessagingError::protocol(format!("failed to decode response: {e}")))
    }

    /// Fire-and-forget message to one member
    pub async fn unicast<Req, E>(
        &self,
        to: &MemberId,
        subject: impl Into<String>,
        request: &Req,
        encode: E,
    ) -> Result<()>
    where
        E: Fn(&Req) -> Vec<u8>,
    {
        let member = self.resolve(to)?;
        self.messaging
            .send_async(member.address().clone(), subject, encode(request), true)
            .await
    }

    /// Fire-and-forget message to a set of members; per-member failures
    /// are logged, not surfaced
    pub async fn multicast<Req, E>(
        &self,
        to: &[MemberId],
        subject: impl Into<String> + Clone,
        request: &Req,
        encode: E,
    ) where
        E: Fn(&Req) -> Vec<u8>,
    {
        for member_id in to {
            if let Err(error) = self
                .unicast(member_id, subject.clone(), request, &encode)
                .await
            {
                debug!(member = %member_id, %error, "multicast send failed");
            }
        }
    }

    /// Fire-and-forget message to every known member except this node
    pub async fn broadcast<Req, E>(&self, subject: impl Into<String> + Clone, request: &Req, encode: E)
    where
        E: Fn(&Req) -> Vec<u8>,
    {
        let own_address = self.messaging.address().clone();
        let targets: Vec<MemberId> = self
            .membership
            .members()
            .into_iter()
            .filter(|member| member.address() != &own_address)
            .map(|member| member.id().clone())
            .collect();
        self.multicast(&targets, subject, request, encode).await;
    }

    /// Register a consume-only subscription. Messages from senders that
    /// are not known cluster members are dropped before decoding.
    pub fn consume<Req, D, F>(&self, subject: impl Into<String>, decode: D, consumer: F)
    where
        D: Fn(&[u8]) -> anyhow::Result<Req> + Send + Sync + 'static,
        F: Fn(Member, Req) + Send + Sync + 'static,
    {
        let membership = Arc::clone(&self.membership);
        self.messaging
            .register_consumer(subject, move |sender, payload| {
                let Some(member) = membership.member_by_address(&sender) else {
                    warn!(%sender, "dropping message from unknown cluster member");
                    return;
                };
                match decode(&payload) {
                    Ok(request) => consumer(member, request),
                    Err(error) => {
                        warn!(%sender, %error, "failed to decode message, dropping it")
                    }
                }
            });
    }

    /// Register a request/reply subscription; the handler's response is
    /// encoded back to the sender
    pub fn reply_to<Req, Res, D, E, F, Fut>(
        &self,
        subject: impl Into<String>,
        decode: D,
        handler: F,
        encode: E,
    ) where
        D: Fn(&[u8]) -> anyhow::Result<Req> + Send + Sync + 'static,
        E: Fn(&Res) -> Vec<u8> + Send + Sync + 'static,
        F: Fn(Member, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Res>> + Send + 'static,
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let decode = Arc::new(decode);
        let encode = Arc::new(encode);
        let handler = Arc::new(handler);
        let membership = Arc::clone(&self.membership);

        self.messaging.register_handler(subject, move |sender, payload| {
            let decode = Arc::clone(&decode);
            let encode = Arc::clone(&encode);
            let handler = Arc::clone(&handler);
            let membership = Arc::clone(&membership);
            async move {
                let member = membership
                    .member_by_address(&sender)
                    .ok_or_else(|| anyhow::anyhow!("unknown cluster member {sender}"))?;
                let request = decode(&payload)?;
                let response = handler(member, request).await?;
                Ok(Bytes::from(encode(&response)))
            }
        });
    }

    /// Remove a subscription; unknown subjects are a no-op
    pub fn unsubscribe(&self, subject: &str) {
        self.messaging.unregister_handler(subject);
    }
}

//! Leader election using Kubernetes Leases
//!
//! Only the replica holding the `coordination.k8s.io/v1` Lease runs the
//! leader-only controllers. Every write carries the resourceVersion that was
//! read, so two replicas can never both believe they took the lease: the
//! second write fails with a conflict and that replica keeps waiting.
//!
//! The holder renews every retry interval and gives up once no renewal has
//! succeeded within the renew deadline. Candidates only treat a lease as
//! expired after seeing it unchanged for a full lease duration on their own
//! clock, and the renew deadline is shorter than that, so the old holder has
//! stopped its controllers before anyone else can start them.
//!
//! Losing the lease is fatal to the holder. There is no in-process way back to
//! candidate; the process exits and its restart competes again.

use crate::config::PROGRAM;
use crate::error::ProvisionError;
use crate::registry::{ControllerContext, LeaderSet};
use crate::tasks::SYSTEM_NAMESPACE;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use resource_client::{ResourceClientTrait, ResourceError};
use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Lease timing.
///
/// `renew_deadline` must be shorter than `lease_duration`, and
/// `retry_interval` shorter than `renew_deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionTiming {
    /// How long a lease stays valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps leading without a successful renewal
    pub renew_deadline: Duration,
    /// How often the holder renews and a candidate retries
    pub retry_interval: Duration,
}

impl Default for ElectionTiming {
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_interval: RETRY_INTERVAL,
        }
    }
}

impl ElectionTiming {
    /// Reject timings that would let a lease expire while its holder still leads.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.renew_deadline >= self.lease_duration {
            return Err(ProvisionError::InvalidConfig(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_interval >= self.renew_deadline {
            return Err(ProvisionError::InvalidConfig(format!(
                "retry interval {:?} must be shorter than renew deadline {:?}",
                self.retry_interval, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Last lease record seen from another holder, and when it was first seen.
#[derive(Debug)]
struct ObservedLease {
    resource_version: Option<String>,
    since: Instant,
}

/// `<hostname>_<uuid>`, unique per process.
pub fn default_identity() -> String {
    let host = env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| PROGRAM.to_string());
    format!("{}_{}", host, Uuid::new_v4())
}

// MicroTime is converted through its RFC 3339 wire form so this module does
// not depend on the time type k8s-openapi wraps.
pub(crate) fn to_micro_time(time: DateTime<Utc>) -> Result<MicroTime, ResourceError> {
    let wire = serde_json::Value::String(time.to_rfc3339_opts(SecondsFormat::Micros, true));
    serde_json::from_value(wire).map_err(|e| ResourceError::InvalidObject(format!("lease time: {}", e)))
}

pub(crate) fn from_micro_time(time: &MicroTime) -> Option<DateTime<Utc>> {
    let wire = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(wire.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Leader elector over a Lease.
pub struct LeaderElector {
    client: Arc<dyn ResourceClientTrait>,
    namespace: String,
    lease_name: String,
    identity: String,
    timing: ElectionTiming,
    observed: Mutex<Option<ObservedLease>>,
}

impl LeaderElector {
    /// Create an elector with default timing (15s lease, 10s renew deadline, 2s retry)
    pub fn new(
        client: Arc<dyn ResourceClientTrait>,
        namespace: &str,
        lease_name: &str,
        identity: &str,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            timing: ElectionTiming::default(),
            observed: Mutex::new(None),
        }
    }

    /// The well-known `kube-system/<program>` lock with a fresh identity
    pub fn for_program(client: Arc<dyn ResourceClientTrait>) -> Self {
        Self::new(client, SYSTEM_NAMESPACE, PROGRAM, &default_identity())
    }

    /// Replace the lease timing
    #[must_use]
    pub fn with_timing(mut self, timing: ElectionTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Holder identity written into the lease
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// `namespace/name` of the lock
    pub fn lock_name(&self) -> String {
        format!("{}/{}", self.namespace, self.lease_name)
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.timing.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// Block until leadership is acquired.
    ///
    /// Transient errors are logged and retried. Returns the instant the
    /// winning attempt started, which is when the renew deadline starts
    /// counting, or `Err(ProvisionError::Cancelled)` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Instant, ProvisionError> {
        self.timing.validate()?;
        info!(identity = %self.identity, lock = %self.lock_name(), "Waiting for leadership");

        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }

            let started = Instant::now();
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return Ok(started);
                }
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying");
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(ProvisionError::Cancelled),
                () = tokio::time::sleep(self.timing.retry_interval) => {}
            }
        }
    }

    /// Keep renewing until leadership is lost or `cancel` fires.
    ///
    /// Renews every retry interval. Failed renewals are retried until the
    /// renew deadline, counted from the start of the last successful renewal
    /// (`renewed_at` for the first round), has passed; a renewal still in
    /// flight at the deadline is abandoned. On cancellation the lease is
    /// released so another replica can take over without waiting for expiry.
    ///
    /// # Returns
    /// * `Ok(())` - cancelled, lease released
    /// * `Err(ProvisionError::LeadershipLost)` - another replica holds the lease,
    ///   or the renew deadline passed
    pub async fn hold(&self, cancel: &CancellationToken, renewed_at: Instant) -> Result<(), ProvisionError> {
        let deadline = self.timing.renew_deadline;
        let mut last_renewal = renewed_at;

        loop {
            let wait = self.timing.retry_interval.min(deadline.saturating_sub(last_renewal.elapsed()));
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.release_lease().await;
                    return Ok(());
                }
                () = tokio::time::sleep(wait) => {}
            }

            let started = Instant::now();
            let remaining = deadline.saturating_sub(last_renewal.elapsed());
            match tokio::time::timeout(remaining, self.try_acquire_or_renew()).await {
                Ok(Ok(true)) => last_renewal = started,
                Ok(Ok(false)) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    return Err(ProvisionError::LeadershipLost(self.lock_name()));
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Lease renewal timed out");
                }
            }

            if last_renewal.elapsed() >= deadline {
                warn!(
                    identity = %self.identity,
                    deadline_ms = deadline.as_millis(),
                    "No successful renewal within the renew deadline, giving up leadership"
                );
                return Err(ProvisionError::LeadershipLost(self.lock_name()));
            }
        }
    }

    /// When the current record of a lease held by someone else was first seen.
    fn observe(&self, resource_version: Option<&str>) -> Instant {
        let mut observed = self.observed.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match observed.as_ref() {
            Some(seen) if seen.resource_version.as_deref() == resource_version => seen.since,
            _ => {
                let now = Instant::now();
                *observed = Some(ObservedLease {
                    resource_version: resource_version.map(str::to_string),
                    since: now,
                });
                now
            }
        }
    }

    /// Try to acquire or renew the lease atomically
    ///
    /// Uses resourceVersion for compare-and-swap semantics:
    /// - Read lease and its resourceVersion
    /// - Decide if we can acquire/renew
    /// - Update with resourceVersion - fails if lease changed since read
    pub async fn try_acquire_or_renew(&self) -> Result<bool, ResourceError> {
        let now = Utc::now();

        let lease = match self.client.get_lease(&self.namespace, &self.lease_name).await {
            Ok(lease) => lease,
            Err(e) if e.is_not_found() => return self.create_lease(now).await,
            Err(e) => return Err(e),
        };

        let spec = lease.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());

        if holder == Some(self.identity.as_str()) {
            return self.renew_lease(&lease, now).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref()).and_then(from_micro_time);
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let lease_duration = duration_secs
            .and_then(|secs| u64::try_from(secs).ok())
            .map_or(self.timing.lease_duration, Duration::from_secs);
        // unchanged for a full lease duration on the local clock
        let stale = self.observe(lease.metadata.resource_version.as_deref()).elapsed() >= lease_duration;
        let is_expired = stale || match (holder, renew_time, duration_secs) {
            (None, _, _) => true,
            (Some(_), Some(renewed), Some(duration)) => {
                now > renewed + chrono::Duration::seconds(i64::from(duration))
            }
            _ => true,
        };

        if is_expired {
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            self.take_over_lease(&lease, now, transitions).await
        } else {
            Ok(false)
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> Result<LeaseSpec, ResourceError> {
        let now = to_micro_time(now)?;
        Ok(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_seconds()),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        })
    }

    /// Create a new lease (first leader)
    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool, ResourceError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)?),
        };

        match self.client.create_lease(&lease).await {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(e) if e.is_already_exists() || e.is_conflict() => {
                debug!(identity = %self.identity, "Lease created concurrently, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Renew a lease we hold
    async fn renew_lease(&self, existing: &Lease, now: DateTime<Utc>) -> Result<bool, ResourceError> {
        if existing.metadata.resource_version.is_none() {
            return Err(ResourceError::InvalidObject(format!(
                "lease {} missing resourceVersion",
                self.lock_name()
            )));
        }

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(to_micro_time(now)?);
        }

        match self.client.update_lease(&updated).await {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                warn!(identity = %self.identity, "Lease renewal conflict");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Take over an expired or released lease
    async fn take_over_lease(
        &self,
        existing: &Lease,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, ResourceError> {
        let Some(resource_version) = existing.metadata.resource_version.clone() else {
            return Err(ResourceError::InvalidObject(format!(
                "lease {} missing resourceVersion",
                self.lock_name()
            )));
        };

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(resource_version),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, transitions.saturating_add(1))?),
        };

        match self.client.update_lease(&lease).await {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions.saturating_add(1),
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Release the lease by clearing the holder identity
    ///
    /// Best effort; failures are logged and the lease simply expires.
    pub async fn release_lease(&self) {
        let mut lease = match self.client.get_lease(&self.namespace, &self.lease_name).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(identity = %self.identity, error = %e, "No lease to release");
                return;
            }
        };

        let Some(spec) = lease.spec.as_mut() else { return };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return;
        }

        spec.holder_identity = None;
        match to_micro_time(Utc::now() - chrono::Duration::seconds(60)) {
            Ok(past) => spec.renew_time = Some(past),
            Err(e) => warn!(error = %e, "Failed to backdate lease renew time"),
        }

        match self.client.update_lease(&lease).await {
            Ok(_) => info!(identity = %self.identity, "Lease released for fast failover"),
            Err(e) => warn!(identity = %self.identity, error = %e, "Failed to release lease"),
        }
    }
}

/// Run the leader-only controllers.
///
/// With `no_leader_elect` the set runs right away; without it the set runs
/// only while this process holds the lease.
///
/// # Returns
/// * `Ok(())` - shutdown requested
/// * `Err(ProvisionError::ControllersExited)` - the set returned before shutdown (election disabled)
/// * `Err(ProvisionError::LeadershipLost)` - another replica took the lease
/// * `Err(ProvisionError::LeaderController)` - a controller failed
pub async fn run_leader_gated(
    no_leader_elect: bool,
    elector: &LeaderElector,
    set: &LeaderSet,
    ctx: ControllerContext,
) -> Result<(), ProvisionError> {
    let cancel = ctx.cancel.clone();

    if no_leader_elect {
        if set.is_empty() {
            debug!("No leader controllers registered");
            cancel.cancelled().await;
            return Ok(());
        }
        set.run(ctx).await?;
        if cancel.is_cancelled() {
            return Ok(());
        }
        return Err(ProvisionError::ControllersExited);
    }

    let acquired_at = match elector.acquire(&cancel).await {
        Ok(at) => at,
        Err(ProvisionError::Cancelled) => return Ok(()),
        Err(e) => return Err(e),
    };
    info!(identity = %elector.identity(), controllers = set.len(), "Running leader controllers");

    let leading = cancel.child_token();
    let leader_ctx = ControllerContext {
        cancel: leading.clone(),
        client: ctx.client.clone(),
    };

    let hold = elector.hold(&cancel, acquired_at);
    tokio::pin!(hold);
    let run = set.run(leader_ctx);
    tokio::pin!(run);
    let mut set_finished = false;

    loop {
        tokio::select! {
            result = &mut hold => {
                leading.cancel();
                return result;
            }
            result = &mut run, if !set_finished => {
                if let Err(e) = result {
                    leading.cancel();
                    elector.release_lease().await;
                    return Err(e);
                }
                debug!("Leader controllers finished, keeping the lease");
                set_finished = true;
            }
        }
    }
}

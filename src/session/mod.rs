//! Per-user template VM session.
//!
//! A session tracks one principal's template VM through its lifecycle:
//! absent, creating, provisioning, ready, and the terminal publish or
//! discard teardown. State is fed by status observations, either from the
//! background poller or an explicit refresh. Observations carry sequence
//! numbers taken at request time, and a response older than the newest
//! applied one is dropped, so a slow straggler can never roll the session
//! back. An accepted create, publish or discard outranks every status
//! request that started before it. The platform answering `exists: false`
//! resets the session from any state: the VM is gone and nothing local can
//! argue otherwise.
//!
//! Publish and discard share a single exclusivity gate. While one of them
//! is in flight the other is rejected locally, before any network call.

mod poll;
pub mod store;

pub use store::{MemorySessionStore, SessionStore};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{LabError, Result};
use crate::remote::{CloudCompute, NewTemplateVm, SnapshotRef, TemplateVmStatus, VmDescriptor};

/// Store kind under which the cached descriptor lives.
pub const SESSION_KIND: &str = "template-vm";

/// Lifecycle phase of the session's template VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateVmState {
    Absent,
    Creating,
    Provisioning,
    Ready,
    Publishing,
    Discarding,
}

impl std::fmt::Display for TemplateVmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Publishing => "publishing",
            Self::Discarding => "discarding",
        };
        write!(f, "{s}")
    }
}

fn phase_for_present(current: TemplateVmState, vm: &VmDescriptor) -> TemplateVmState {
    match current {
        // Teardown keeps its phase until the VM actually disappears.
        TemplateVmState::Publishing => TemplateVmState::Publishing,
        TemplateVmState::Discarding => TemplateVmState::Discarding,
        _ => {
            if vm.provisioned() {
                TemplateVmState::Ready
            } else {
                TemplateVmState::Provisioning
            }
        }
    }
}

struct SessionState {
    phase: TemplateVmState,
    vm: Option<VmDescriptor>,
    busy: bool,
    applied_seq: u64,
}

struct SessionInner {
    user_id: String,
    compute: Arc<dyn CloudCompute>,
    store: Arc<dyn SessionStore>,
    snapshot_prefix: String,
    fragment_max_len: usize,
    state: Mutex<SessionState>,
    seq: AtomicU64,
    watch_tx: watch::Sender<TemplateVmState>,
}

impl SessionInner {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn phase(&self) -> TemplateVmState {
        self.state.lock().phase
    }

    /// Apply a status observation taken under `seq`. Stale responses are
    /// dropped; an absent response resets the session unconditionally.
    async fn apply_status(&self, seq: u64, status: TemplateVmStatus) {
        let (cache, changed, phase) = {
            let mut st = self.state.lock();
            if seq <= st.applied_seq {
                debug!(
                    user = %self.user_id,
                    seq,
                    applied = st.applied_seq,
                    "Dropping stale template VM status"
                );
                return;
            }
            st.applied_seq = seq;
            match status {
                TemplateVmStatus::Present(vm) => {
                    let next = phase_for_present(st.phase, &vm);
                    let changed = st.phase != next;
                    st.phase = next;
                    st.vm = Some(vm.clone());
                    (Some(vm), changed, next)
                }
                TemplateVmStatus::Absent { .. } => {
                    let changed = st.phase != TemplateVmState::Absent;
                    st.phase = TemplateVmState::Absent;
                    st.vm = None;
                    st.busy = false;
                    (None, changed, TemplateVmState::Absent)
                }
            }
        };

        if changed {
            info!(user = %self.user_id, state = %phase, "Template VM state changed");
            self.watch_tx.send_replace(phase);
        }
        self.sync_cache(cache).await;
    }

    /// Adopt the descriptor returned by an accepted create. The acceptance
    /// is the newest server truth, so it outranks any status request that
    /// started while the create was in flight.
    async fn apply_created(&self, vm: VmDescriptor) -> TemplateVmState {
        let (cache, changed, phase) = {
            let mut st = self.state.lock();
            // Bump past any status request that started before acceptance.
            st.applied_seq = self.next_seq();
            let next = if vm.provisioned() {
                TemplateVmState::Ready
            } else {
                TemplateVmState::Creating
            };
            let changed = st.phase != next;
            st.phase = next;
            st.vm = Some(vm.clone());
            (Some(vm), changed, next)
        };

        if changed {
            info!(user = %self.user_id, state = %phase, "Template VM state changed");
            self.watch_tx.send_replace(phase);
        }
        self.sync_cache(cache).await;
        phase
    }

    async fn sync_cache(&self, vm: Option<VmDescriptor>) {
        match vm {
            Some(vm) => {
                if let Ok(value) = serde_json::to_value(&vm) {
                    self.store.set(&self.user_id, SESSION_KIND, value).await;
                }
            }
            None => self.store.clear(&self.user_id, SESSION_KIND).await,
        }
    }

    /// Claim the teardown gate for publication. Only a ready VM can be
    /// snapshotted.
    fn begin_publish(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.phase != TemplateVmState::Ready {
            return Err(LabError::validation(format!(
                "cannot publish: template VM is {}, expected ready",
                st.phase
            )));
        }
        if st.busy {
            return Err(LabError::validation(
                "cannot publish: another publish or discard is in flight",
            ));
        }
        st.busy = true;
        Ok(())
    }

    /// Claim the teardown gate for discard. Any live VM can be discarded,
    /// including one still provisioning; a teardown already underway
    /// cannot be discarded again.
    fn begin_discard(&self) -> Result<()> {
        let mut st = self.state.lock();
        match st.phase {
            TemplateVmState::Creating
            | TemplateVmState::Provisioning
            | TemplateVmState::Ready => {}
            phase => {
                return Err(LabError::validation(format!(
                    "cannot discard: template VM is {phase}"
                )));
            }
        }
        if st.busy {
            return Err(LabError::validation(
                "cannot discard: another publish or discard is in flight",
            ));
        }
        st.busy = true;
        Ok(())
    }

    /// Release the gate after acceptance and move to the teardown phase.
    fn finish_exclusive(&self, next: TemplateVmState) {
        let mut st = self.state.lock();
        st.busy = false;
        // Bump past any status request that started before the mutation.
        st.applied_seq = self.next_seq();
        let changed = st.phase != next;
        st.phase = next;
        drop(st);
        if changed {
            self.watch_tx.send_replace(next);
        }
    }

    /// Release the gate after a failure, keeping the ready state.
    fn abort_exclusive(&self) {
        self.state.lock().busy = false;
    }

    async fn poll_once(&self) {
        let seq = self.next_seq();
        match self.compute.template_vm_status(&self.user_id).await {
            Ok(status) => self.apply_status(seq, status).await,
            Err(err) => {
                warn!(user = %self.user_id, error = %err, "Template VM status poll failed");
            }
        }
    }
}

/// Manager for one principal's template VM.
pub struct TemplateVmSession {
    inner: Arc<SessionInner>,
    poll_interval: Duration,
    poller: Mutex<Option<poll::PollHandle>>,
}

impl TemplateVmSession {
    /// Open a session for the user. Purges every other user's cached
    /// entries, then adopts the user's own cached descriptor if one
    /// survives; the first status observation reconciles it.
    pub async fn open(
        compute: Arc<dyn CloudCompute>,
        store: Arc<dyn SessionStore>,
        user_id: &str,
        config: &SessionConfig,
    ) -> Self {
        store.purge_other_users(user_id).await;

        let cached = store
            .get(user_id, SESSION_KIND)
            .await
            .and_then(|value| serde_json::from_value::<VmDescriptor>(value).ok());
        let phase = match &cached {
            Some(vm) => phase_for_present(TemplateVmState::Absent, vm),
            None => TemplateVmState::Absent,
        };
        if let Some(vm) = &cached {
            debug!(user = %user_id, vm = %vm.name, state = %phase, "Adopted cached template VM");
        }

        let (watch_tx, _) = watch::channel(phase);
        let inner = Arc::new(SessionInner {
            user_id: user_id.to_string(),
            compute,
            store,
            snapshot_prefix: config.snapshot_prefix.clone(),
            fragment_max_len: config.fragment_max_len,
            state: Mutex::new(SessionState {
                phase,
                vm: cached,
                busy: false,
                applied_seq: 0,
            }),
            seq: AtomicU64::new(0),
            watch_tx,
        });

        Self {
            inner,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            poller: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn state(&self) -> TemplateVmState {
        self.inner.phase()
    }

    pub fn descriptor(&self) -> Option<VmDescriptor> {
        self.inner.state.lock().vm.clone()
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<TemplateVmState> {
        self.inner.watch_tx.subscribe()
    }

    /// Request a new template VM. Only valid while no VM exists. The
    /// upstream create is idempotent, so an existing VM is adopted rather
    /// than treated as a conflict.
    pub async fn create(&self, spec: NewTemplateVm) -> Result<TemplateVmState> {
        if spec.credential.username.trim().is_empty() {
            return Err(LabError::validation_field(
                "username",
                "an admin username is required",
            ));
        }
        if spec.credential.password.is_empty() {
            return Err(LabError::validation_field(
                "password",
                "an admin password is required",
            ));
        }
        {
            let st = self.inner.state.lock();
            if st.phase != TemplateVmState::Absent {
                return Err(LabError::validation(format!(
                    "a template VM session is already {}",
                    st.phase
                )));
            }
        }

        let vm = self
            .inner
            .compute
            .create_template_vm(&self.inner.user_id, &spec)
            .await?;
        info!(user = %self.inner.user_id, vm = %vm.name, os = %spec.os_kind, "Template VM create accepted");
        Ok(self.inner.apply_created(vm).await)
    }

    /// Fetch the current status once and apply it.
    pub async fn refresh_now(&self) -> Result<TemplateVmState> {
        let seq = self.inner.next_seq();
        let status = self
            .inner
            .compute
            .template_vm_status(&self.inner.user_id)
            .await?;
        self.inner.apply_status(seq, status).await;
        Ok(self.state())
    }

    /// Snapshot the ready VM under `{prefix}-{fragment}` and tear it down.
    /// The fragment is sanitized to letters, digits and hyphens and capped
    /// at the configured length.
    pub async fn publish_snapshot(&self, fragment: &str) -> Result<SnapshotRef> {
        let name = self.snapshot_name(fragment)?;
        self.inner.begin_publish()?;

        match self
            .inner
            .compute
            .publish_snapshot(&self.inner.user_id, &name)
            .await
        {
            Ok(snapshot) => {
                self.inner.finish_exclusive(TemplateVmState::Publishing);
                info!(
                    user = %self.inner.user_id,
                    snapshot = %snapshot.name,
                    "Snapshot publish accepted"
                );
                Ok(snapshot)
            }
            Err(err) => {
                self.inner.abort_exclusive();
                warn!(user = %self.inner.user_id, error = %err, "Snapshot publish failed");
                Err(err)
            }
        }
    }

    /// Tear the VM down without publishing anything. Works from any live
    /// state, so a stuck provisioning can always be abandoned.
    pub async fn discard(&self) -> Result<()> {
        self.inner.begin_discard()?;

        match self
            .inner
            .compute
            .discard_template_vm(&self.inner.user_id)
            .await
        {
            Ok(()) => {
                self.inner.finish_exclusive(TemplateVmState::Discarding);
                info!(user = %self.inner.user_id, "Template VM discard accepted");
                Ok(())
            }
            Err(err) => {
                self.inner.abort_exclusive();
                warn!(user = %self.inner.user_id, error = %err, "Template VM discard failed");
                Err(err)
            }
        }
    }

    /// Start background polling. A second call while polling is running
    /// has no effect.
    pub fn start_polling(&self) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *poller = Some(poll::spawn_poll_task(self.poll_interval, move || {
            let inner = inner.clone();
            async move {
                inner.poll_once().await;
            }
        }));
        debug!(user = %self.inner.user_id, "Template VM status polling started");
    }

    pub fn stop_polling(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.stop();
            debug!(user = %self.inner.user_id, "Template VM status polling stopped");
        }
    }

    fn snapshot_name(&self, fragment: &str) -> Result<String> {
        let trimmed = fragment.trim();
        let mut cleaned = String::with_capacity(trimmed.len());
        let mut pending_sep = false;
        for ch in trimmed.chars() {
            if ch.is_ascii_alphanumeric() {
                if pending_sep && !cleaned.is_empty() {
                    cleaned.push('-');
                }
                pending_sep = false;
                cleaned.push(ch);
            } else {
                pending_sep = true;
            }
        }
        cleaned.truncate(self.inner.fragment_max_len);
        while cleaned.ends_with('-') {
            cleaned.pop();
        }
        if cleaned.is_empty() {
            return Err(LabError::validation_field(
                "name",
                "a snapshot name fragment is required",
            ));
        }
        Ok(format!("{}-{}", self.inner.snapshot_prefix, cleaned))
    }
}

//! Adapter wrapper for externally locked wallets
//!
//! Some deployments keep the wallet password outside the node and lock the
//! wallet through a separate mechanism, signalled by a flag file. While the
//! flag is set every call fails fast with [`GatewayError::Locked`] instead
//! of reaching the backend. Open listener streams re-check the flag for
//! every item and end with a `Locked` error once it is set. Unlocking runs
//! an external command and then waits, bounded, for the flag to clear.

use super::types::*;
use super::{ForwardStream, InvoiceStream, LightningNode, NodeHandle};
use crate::{GatewayError, GatewayResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Source of the external lock state
#[async_trait]
pub trait LockFlag: Send + Sync {
    /// Whether the wallet is currently locked
    async fn is_locked(&self) -> GatewayResult<bool>;
}

/// Runs the external unlock mechanism
#[async_trait]
pub trait UnlockCommand: Send + Sync {
    /// Submit `password`; `false` when the mechanism rejected it
    async fn run(&self, password: &str) -> GatewayResult<bool>;
}

/// Locked while a flag file exists
pub struct FileLockFlag {
    path: PathBuf,
}

impl FileLockFlag {
    /// Watch `path`
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl LockFlag for FileLockFlag {
    async fn is_locked(&self) -> GatewayResult<bool> {
        tokio::fs::try_exists(&self.path).await.map_err(|e| {
            error!("Cannot read lock flag {}: {}", self.path.display(), e);
            GatewayError::Internal("cannot determine wallet lock state".to_string())
        })
    }
}

/// Runs a command with the password on stdin; exit status 0 means accepted
pub struct CommandUnlocker {
    argv: Vec<String>,
}

impl CommandUnlocker {
    /// Command line to run, program first
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl UnlockCommand for CommandUnlocker {
    async fn run(&self, password: &str) -> GatewayResult<bool> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(GatewayError::Unsupported(
                "no unlock command configured".to_string(),
            ));
        };

        debug!("Running unlock command {}", program);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to start unlock command {}: {}", program, e);
                GatewayError::Internal("unlock command could not be started".to_string())
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let written = stdin.write_all(format!("{}\n", password).as_bytes()).await;
            if let Err(e) = written {
                warn!("Unlock command closed stdin early: {}", e);
            }
        }

        let output = child.wait_with_output().await.map_err(|e| {
            error!("Unlock command failed: {}", e);
            GatewayError::Internal("unlock command failed".to_string())
        })?;

        if !output.status.success() {
            warn!(
                "Unlock command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }
}

/// Wraps an adapter so that the external lock gates every call
pub struct LockAwareAdapter {
    inner: NodeHandle,
    flag: Arc<dyn LockFlag>,
    unlocker: Arc<dyn UnlockCommand>,
    unlock_timeout: Duration,
    poll_interval: Duration,
}

impl LockAwareAdapter {
    /// Wrap `inner`. After a successful unlock command the flag is polled
    /// every `poll_interval` for at most `unlock_timeout`.
    pub fn new(
        inner: NodeHandle,
        flag: Arc<dyn LockFlag>,
        unlocker: Arc<dyn UnlockCommand>,
        unlock_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner,
            flag,
            unlocker,
            unlock_timeout,
            poll_interval,
        }
    }

    /// Await `call` only if the wallet is unlocked. `call` is lazy, so a
    /// locked wallet never reaches the backend.
    async fn guarded<T, F>(&self, call: F) -> GatewayResult<T>
    where
        F: Future<Output = GatewayResult<T>>,
    {
        if self.flag.is_locked().await? {
            return Err(locked());
        }
        call.await
    }
}

fn locked() -> GatewayError {
    GatewayError::Locked("wallet is locked".to_string())
}

/// Pass items through while the flag stays clear. The first item seen
/// after the wallet got locked is replaced by a `Locked` error and the
/// stream ends there.
fn gated<T: Send + 'static>(
    stream: BoxStream<'static, GatewayResult<T>>,
    flag: Arc<dyn LockFlag>,
) -> BoxStream<'static, GatewayResult<T>> {
    futures::stream::unfold(Some(stream), move |state| {
        let flag = flag.clone();
        async move {
            let mut stream = state?;
            let item = stream.next().await?;
            match flag.is_locked().await {
                Ok(false) => Some((item, Some(stream))),
                Ok(true) => {
                    debug!("Wallet locked, closing listener stream");
                    Some((Err(locked()), None))
                }
                Err(e) => Some((Err(e), None)),
            }
        }
    })
    .boxed()
}

#[async_trait]
impl LightningNode for LockAwareAdapter {
    fn get_implementation_name(&self) -> &'static str {
        self.inner.get_implementation_name()
    }

    async fn probe(&self, timeout: Duration) -> GatewayResult<NodeInfo> {
        self.guarded(self.inner.probe(timeout)).await
    }

    async fn get_node_info(&self) -> GatewayResult<NodeInfo> {
        self.guarded(self.inner.get_node_info()).await
    }

    async fn get_wallet_balance(&self) -> GatewayResult<WalletBalance> {
        self.guarded(self.inner.get_wallet_balance()).await
    }

    async fn list_invoices(
        &self,
        query: ListQuery,
        filter: InvoiceFilter,
    ) -> GatewayResult<Vec<Invoice>> {
        self.guarded(self.inner.list_invoices(query, filter)).await
    }

    async fn list_payments(
        &self,
        query: ListQuery,
        filter: PaymentFilter,
    ) -> GatewayResult<Vec<Payment>> {
        self.guarded(self.inner.list_payments(query, filter)).await
    }

    async fn list_on_chain_tx(&self, query: ListQuery) -> GatewayResult<Vec<OnChainTransaction>> {
        self.guarded(self.inner.list_on_chain_tx(query)).await
    }

    async fn list_all_tx(&self, query: ListQuery, filter: TxFilter) -> GatewayResult<Vec<GenericTx>> {
        self.guarded(self.inner.list_all_tx(query, filter)).await
    }

    async fn add_invoice(&self, req: NewInvoice) -> GatewayResult<Invoice> {
        self.guarded(self.inner.add_invoice(req)).await
    }

    async fn decode_pay_request(&self, pay_req: &str) -> GatewayResult<PaymentRequest> {
        self.guarded(self.inner.decode_pay_request(pay_req)).await
    }

    async fn send_payment(&self, req: SendPayment) -> GatewayResult<Payment> {
        self.guarded(self.inner.send_payment(req)).await
    }

    async fn send_coins(&self, req: SendCoins) -> GatewayResult<SendCoinsResult> {
        self.guarded(self.inner.send_coins(req)).await
    }

    async fn get_fee_revenue(&self) -> GatewayResult<FeeRevenue> {
        self.guarded(self.inner.get_fee_revenue()).await
    }

    async fn unlock_wallet(&self, password: &str) -> GatewayResult<bool> {
        if !self.flag.is_locked().await? {
            return self.inner.unlock_wallet(password).await;
        }

        info!("Running external wallet unlock");
        if !self.unlocker.run(password).await? {
            return Ok(false);
        }

        let deadline = Instant::now() + self.unlock_timeout;
        loop {
            if !self.flag.is_locked().await? {
                info!("Wallet unlocked");
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                // The bound is inclusive: a flag cleared at the deadline
                // itself still counts.
                tokio::task::yield_now().await;
                if !self.flag.is_locked().await? {
                    info!("Wallet unlocked");
                    return Ok(true);
                }
                warn!("Wallet still locked {:?} after unlock", self.unlock_timeout);
                return Err(GatewayError::Timeout(format!(
                    "wallet still locked after {:?}",
                    self.unlock_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn listen_invoices(&self) -> GatewayResult<InvoiceStream> {
        let stream = self.guarded(self.inner.listen_invoices()).await?;
        Ok(gated(stream, self.flag.clone()))
    }

    async fn listen_forward_events(&self) -> GatewayResult<ForwardStream> {
        let stream = self.guarded(self.inner.listen_forward_events()).await?;
        Ok(gated(stream, self.flag.clone()))
    }

    async fn channel_open(&self, req: OpenChannel) -> GatewayResult<String> {
        self.guarded(self.inner.channel_open(req)).await
    }

    async fn channel_list(&self) -> GatewayResult<Vec<Channel>> {
        self.guarded(self.inner.channel_list()).await
    }

    async fn channel_close(&self, channel_id: &str, force: bool) -> GatewayResult<String> {
        self.guarded(self.inner.channel_close(channel_id, force)).await
    }

    async fn peer_resolve_alias(&self, node_pub: &str) -> GatewayResult<String> {
        self.guarded(self.inner.peer_resolve_alias(node_pub)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::testing::FakeNode;
    use crate::ErrorKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestFlag(Arc<AtomicBool>);

    #[async_trait]
    impl LockFlag for TestFlag {
        async fn is_locked(&self) -> GatewayResult<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    /// Accepts "open-sesame"; clears the flag after `delay` if set
    struct TestUnlocker {
        flag: Arc<AtomicBool>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl UnlockCommand for TestUnlocker {
        async fn run(&self, password: &str) -> GatewayResult<bool> {
            if password != "open-sesame" {
                return Ok(false);
            }
            if let Some(delay) = self.delay {
                let flag = self.flag.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    flag.store(false, Ordering::SeqCst);
                });
            }
            Ok(true)
        }
    }

    fn adapter(
        inner: Arc<FakeNode>,
        locked: bool,
        clears_after: Option<Duration>,
    ) -> (LockAwareAdapter, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(locked));
        let adapter = LockAwareAdapter::new(
            inner,
            Arc::new(TestFlag(flag.clone())),
            Arc::new(TestUnlocker {
                flag: flag.clone(),
                delay: clears_after,
            }),
            Duration::from_secs(10),
            Duration::from_millis(250),
        );
        (adapter, flag)
    }

    #[tokio::test]
    async fn test_locked_calls_never_reach_backend() {
        let inner = FakeNode::ready();
        let (adapter, _) = adapter(inner.clone(), true, None);

        let err = adapter.get_wallet_balance().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);
        assert_eq!(adapter.probe(Duration::from_secs(1)).await.unwrap_err().kind(), ErrorKind::Locked);
        assert_eq!(inner.balance_calls(), 0);
        assert_eq!(inner.probe_count(), 0);
    }

    #[tokio::test]
    async fn test_unlocked_calls_pass_through() {
        let inner = FakeNode::ready();
        let (adapter, _) = adapter(inner.clone(), false, None);
        adapter.get_wallet_balance().await.unwrap();
        assert_eq!(inner.balance_calls(), 1);
        assert_eq!(adapter.get_implementation_name(), "FAKE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_waits_for_flag_to_clear() {
        let (adapter, flag) = adapter(FakeNode::ready(), true, Some(Duration::from_secs(3)));
        assert!(adapter.unlock_wallet("open-sesame").await.unwrap());
        assert!(!flag.load(Ordering::SeqCst));
        adapter.get_wallet_balance().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_times_out_when_flag_stays() {
        let (adapter, _) = adapter(FakeNode::ready(), true, None);
        let started = Instant::now();
        let err = adapter.unlock_wallet("open-sesame").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_flag_cleared_exactly_at_deadline() {
        let (adapter, _) = adapter(FakeNode::ready(), true, Some(Duration::from_secs(10)));
        assert!(adapter.unlock_wallet("open-sesame").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_flag_cleared_just_past_deadline() {
        let (adapter, _) = adapter(
            FakeNode::ready(),
            true,
            Some(Duration::from_secs(10) + Duration::from_millis(1)),
        );
        let err = adapter.unlock_wallet("open-sesame").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unlock_rejected_password() {
        let (adapter, flag) = adapter(FakeNode::ready(), true, Some(Duration::ZERO));
        assert!(!adapter.unlock_wallet("wrong").await.unwrap());
        assert!(flag.load(Ordering::SeqCst));
    }

    fn forward(fee_msat: u64) -> ForwardSuccessEvent {
        ForwardSuccessEvent {
            timestamp_ns: 1,
            settled_ns: 2,
            chan_id_in: "1".to_string(),
            chan_id_out: "2".to_string(),
            amt_in_msat: 1_000 + fee_msat,
            amt_out_msat: 1_000,
            fee_msat,
        }
    }

    #[tokio::test]
    async fn test_listener_ends_once_wallet_locks() {
        let inner = FakeNode::ready();
        inner.push_forwards(vec![Ok(forward(1)), Ok(forward(2)), Ok(forward(3))]);
        let (adapter, flag) = adapter(inner, false, None);

        let mut stream = adapter.listen_forward_events().await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().fee_msat, 1);

        flag.store(true, Ordering::SeqCst);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Locked);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_listener_refused_while_locked() {
        let (adapter, _) = adapter(FakeNode::ready(), true, None);
        let err = adapter.listen_invoices().await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Locked);
    }

    #[tokio::test]
    async fn test_file_lock_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.locked");
        let flag = FileLockFlag::new(path.clone());
        assert!(!flag.is_locked().await.unwrap());
        std::fs::write(&path, b"").unwrap();
        assert!(flag.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_command_unlocker_reads_stdin() {
        let unlocker = CommandUnlocker::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            r#"read pw; [ "$pw" = "open-sesame" ]"#.to_string(),
        ]);
        assert!(unlocker.run("open-sesame").await.unwrap());
        assert!(!unlocker.run("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_command_unlocker_without_command() {
        let err = CommandUnlocker::new(Vec::new()).run("x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}

//! Value types exchanged over the capability interface
//!
//! All of these are immutable snapshots produced fresh by each adapter call.
//! Amounts suffixed `_sat` are satoshis, `_msat` millisatoshis; timestamps are
//! unix seconds unless suffixed `_ns`.

use crate::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};

/// Node identity and status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeInfo {
    /// Backend implementation name (`LND_REST`, `CLN_UNIX_SOCKET`, ...)
    pub implementation: String,
    /// Backend software version
    pub version: String,
    /// Node public key (hex)
    pub identity_pubkey: String,
    /// Node alias
    pub alias: String,
    /// Node color (`#rrggbb`)
    pub color: String,
    /// Channels being opened
    pub num_pending_channels: u32,
    /// Channels usable right now
    pub num_active_channels: u32,
    /// Open channels whose peer is offline
    pub num_inactive_channels: u32,
    /// Connected peers
    pub num_peers: u32,
    /// Best block height seen by the node
    pub block_height: u32,
    /// Best block hash, if the backend reports it
    pub block_hash: String,
    /// Chain backend fully synced
    pub synced_to_chain: bool,
    /// Gossip graph synced
    pub synced_to_graph: bool,
    /// Network name (`mainnet`, `testnet`, `signet`, `regtest`)
    pub network: String,
    /// Public `pubkey@host:port` URIs
    pub uris: Vec<String>,
}

/// On-chain and channel balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WalletBalance {
    /// Confirmed on-chain balance (sat)
    pub onchain_confirmed_balance: u64,
    /// Unconfirmed on-chain balance (sat)
    pub onchain_unconfirmed_balance: u64,
    /// Total on-chain balance (sat)
    pub onchain_total_balance: u64,
    /// Our side of open channels (msat)
    pub channel_local_balance: u64,
    /// Peers' side of open channels (msat)
    pub channel_remote_balance: u64,
    /// Our side of pending channels (msat)
    pub channel_pending_open_local_balance: u64,
    /// Peers' side of pending channels (msat)
    pub channel_pending_open_remote_balance: u64,
}

/// Invoice lifecycle: `open -> settled | canceled`, or `accepted -> settled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    /// Waiting for payment
    Open,
    /// Paid
    Settled,
    /// Canceled or expired
    Canceled,
    /// HTLCs held, not yet settled (hold invoices)
    Accepted,
}

/// An invoice we issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Backend index or caller label, as an opaque string
    pub add_index: String,
    /// BOLT11 payment request
    pub payment_request: String,
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Description
    pub memo: String,
    /// Requested amount (msat), 0 for any-amount invoices
    pub value_msat: u64,
    /// Amount actually received (msat)
    pub amt_paid_msat: u64,
    /// Lifecycle state
    pub state: InvoiceState,
    /// Creation time
    pub creation_date: i64,
    /// Settle time
    pub settle_date: Option<i64>,
    /// Expiry in seconds after creation
    pub expiry: u64,
    /// Monotonic settlement cursor
    pub settle_index: Option<u64>,
    /// Spontaneous (keysend) payment
    pub is_keysend: bool,
}

/// Outgoing payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Backend did not say
    Unknown,
    /// HTLCs still in flight
    InFlight,
    /// Preimage received
    Succeeded,
    /// Terminally failed
    Failed,
}

/// One HTLC attempt of a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HtlcAttempt {
    /// Attempt status as reported by the backend
    pub status: String,
    /// Amount delivered by this attempt (msat)
    pub amount_msat: u64,
    /// Routing fees of this attempt (msat)
    pub fee_msat: u64,
    /// Number of hops
    pub hops: u32,
    /// Attempt start
    pub attempt_time: i64,
    /// Attempt resolution
    pub resolve_time: Option<i64>,
}

/// An outgoing payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Preimage (hex), once succeeded
    pub payment_preimage: Option<String>,
    /// Paid BOLT11 request, if any
    pub payment_request: Option<String>,
    /// Amount delivered (msat)
    pub value_msat: u64,
    /// Fees paid (msat)
    pub fee_msat: u64,
    /// Status
    pub status: PaymentStatus,
    /// Creation time
    pub creation_date: i64,
    /// Backend failure reason, when failed
    pub failure_reason: Option<String>,
    /// Attempted routes
    pub htlcs: Vec<HtlcAttempt>,
}

/// A decoded BOLT11 payment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// Payee public key
    pub destination: String,
    /// Payment hash (hex)
    pub payment_hash: String,
    /// Requested amount (msat); `None` for any-amount requests
    pub num_msat: Option<u64>,
    /// Creation time
    pub timestamp: i64,
    /// Seconds until expiry
    pub expiry: u64,
    /// Description
    pub description: String,
    /// Description hash, if committed instead of a description
    pub description_hash: Option<String>,
    /// On-chain fallback address
    pub fallback_addr: Option<String>,
    /// Final CLTV delta
    pub cltv_expiry: u64,
}

/// An on-chain wallet transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainTransaction {
    /// Transaction id
    pub tx_hash: String,
    /// Net effect on the wallet (sat); negative when sending
    pub amount: i64,
    /// Confirmations
    pub num_confirmations: u32,
    /// Confirmation height (0 while unconfirmed)
    pub block_height: u32,
    /// First seen / confirmation time
    pub time_stamp: i64,
    /// Fees paid by us (sat)
    pub total_fees: u64,
    /// Output addresses
    pub dest_addresses: Vec<String>,
    /// Wallet label
    pub label: String,
}

/// Which ledger a [`GenericTx`] comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxCategory {
    /// Base layer
    Onchain,
    /// Lightning
    Lightning,
}

/// Direction of a [`GenericTx`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    /// Outgoing
    Send,
    /// Incoming
    Receive,
    /// Neither (e.g. zero-value self transfer)
    Unknown,
}

/// Status of a [`GenericTx`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Waiting
    Pending,
    /// Done
    Succeeded,
    /// Failed or canceled
    Failed,
    /// Unknown
    Unknown,
}

/// One row of the unified transaction feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericTx {
    /// Position in the merged feed
    pub index: usize,
    /// Source-specific id (tx hash, payment hash, invoice index)
    pub id: String,
    /// Source ledger
    pub category: TxCategory,
    /// Direction
    pub tx_type: TxType,
    /// Amount (msat); negative when sending
    pub amount_msat: i64,
    /// Creation time
    pub time_stamp: i64,
    /// Status
    pub status: TxStatus,
    /// Memo / label
    pub comment: String,
    /// Confirmation height, on-chain only
    pub block_height: Option<u32>,
    /// Confirmations, on-chain only
    pub num_confs: Option<u32>,
}

/// Result of an on-chain send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCoinsResult {
    /// Transaction id
    pub txid: String,
    /// Destination
    pub address: String,
    /// Amount sent (sat); `None` when sweeping the whole wallet
    pub amount: Option<u64>,
    /// Wallet label
    pub label: String,
}

/// Routing fee income (msat) over rolling windows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeeRevenue {
    /// Last 24 hours
    pub day: u64,
    /// Last 7 days
    pub week: u64,
    /// Last 30 days
    pub month: u64,
    /// Last 365 days
    pub year: u64,
    /// All time
    pub total: u64,
}

/// Channel lifecycle: `opening -> normal -> {closing, force_closing} -> closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Funding not yet confirmed
    Opening,
    /// Usable
    Normal,
    /// Cooperative close in progress
    Closing,
    /// Unilateral close in progress
    ForceClosing,
    /// Closed
    Closed,
    /// Backend state we do not map
    Unknown,
}

/// Which side initiated an open or close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    /// Us
    Local,
    /// The peer
    Remote,
    /// Unknown
    Unknown,
}

/// A channel with a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Backend-specific id (`txid:vout` for LND, channel id for CLN)
    pub channel_id: String,
    /// Peer connected and channel usable
    pub active: bool,
    /// Peer public key
    pub peer_publickey: String,
    /// Peer alias, resolved through the alias cache
    pub peer_alias: String,
    /// Our balance (sat)
    pub balance_local: u64,
    /// Peer balance (sat)
    pub balance_remote: u64,
    /// Capacity (sat)
    pub balance_capacity: u64,
    /// Lifecycle state
    pub state: ChannelState,
    /// Who opened
    pub initiator: Initiator,
    /// Who closed, for closing/closed channels
    pub closer: Option<Initiator>,
}

/// States of the node initialization state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitState {
    /// Transport unreachable
    Offline,
    /// Reachable, RPC services still starting
    Bootstrapping,
    /// Wallet needs an unlock
    Locked,
    /// Unlocked, finishing boot
    BootstrappingAfterUnlock,
    /// Ready; terminal
    Done,
}

/// One transition of the initialization state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitLnRepoUpdate {
    /// New state
    pub state: InitState,
    /// Human readable detail
    pub msg: String,
}

impl InitLnRepoUpdate {
    /// Build an update
    pub fn new(state: InitState, msg: impl Into<String>) -> Self {
        Self {
            state,
            msg: msg.into(),
        }
    }
}

/// One successfully routed HTLC forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSuccessEvent {
    /// Forward start time (ns)
    pub timestamp_ns: u64,
    /// Settlement time (ns)
    pub settled_ns: u64,
    /// Incoming channel
    pub chan_id_in: String,
    /// Outgoing channel
    pub chan_id_out: String,
    /// Incoming amount (msat)
    pub amt_in_msat: u64,
    /// Outgoing amount (msat)
    pub amt_out_msat: u64,
    /// Earned fee: incoming minus outgoing (msat)
    pub fee_msat: u64,
}

/// Paging for list operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListQuery {
    /// Items to skip
    #[serde(default)]
    pub index_offset: u64,
    /// Items to return; 0 means all
    #[serde(default)]
    pub max_count: u64,
    /// Newest first
    #[serde(default)]
    pub reversed: bool,
}

impl ListQuery {
    /// Everything, oldest first
    pub fn all() -> Self {
        Self::default()
    }

    /// Apply offset and limit to an already ordered list
    pub fn page<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.index_offset as usize);
        if self.max_count == 0 {
            iter.collect()
        } else {
            iter.take(self.max_count as usize).collect()
        }
    }

    /// Order then page a list that is sorted oldest first
    pub fn apply<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if self.reversed {
            items.reverse();
        }
        self.page(items)
    }
}

/// Filter for [`crate::node::LightningNode::list_invoices`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InvoiceFilter {
    /// Only open / accepted invoices
    #[serde(default)]
    pub pending_only: bool,
}

/// Filter for [`crate::node::LightningNode::list_payments`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PaymentFilter {
    /// Also return in-flight and failed payments
    #[serde(default)]
    pub include_incomplete: bool,
}

/// Filter for [`crate::node::LightningNode::list_all_tx`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TxFilter {
    /// Drop pending, failed and canceled entries
    #[serde(default)]
    pub successful_only: bool,
}

/// Parameters of [`crate::node::LightningNode::add_invoice`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoice {
    /// Amount (msat), 0 for any amount
    pub value_msat: u64,
    /// Description
    #[serde(default)]
    pub memo: String,
    /// Seconds until expiry
    #[serde(default = "default_invoice_expiry")]
    pub expiry: u64,
    /// Accept spontaneous (keysend/AMP) payments
    #[serde(default)]
    pub is_keysend: bool,
}

/// Default invoice expiry: one week
pub const DEFAULT_INVOICE_EXPIRY: u64 = 604_800;

fn default_invoice_expiry() -> u64 {
    DEFAULT_INVOICE_EXPIRY
}

/// Parameters of [`crate::node::LightningNode::send_payment`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPayment {
    /// BOLT11 request
    pub pay_req: String,
    /// Give up after this many seconds
    #[serde(default = "default_payment_timeout")]
    pub timeout_seconds: u32,
    /// Max routing fee (msat)
    pub fee_limit_msat: Option<u64>,
    /// Amount (msat) for any-amount requests
    pub amount_msat: Option<u64>,
}

fn default_payment_timeout() -> u32 {
    60
}

/// Parameters of [`crate::node::LightningNode::send_coins`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendCoins {
    /// Destination address
    pub address: String,
    /// Amount (sat); must be absent when `send_all` is set
    pub amount: Option<u64>,
    /// Sweep the whole wallet
    #[serde(default)]
    pub send_all: bool,
    /// Confirmation target (blocks)
    pub target_conf: Option<u32>,
    /// Explicit fee rate (sat/vbyte); wins over `target_conf`
    pub sat_per_vbyte: Option<u64>,
    /// Only spend outputs with this many confirmations
    #[serde(default = "default_min_confs")]
    pub min_confs: u32,
    /// Wallet label
    #[serde(default)]
    pub label: String,
}

fn default_min_confs() -> u32 {
    1
}

impl SendCoins {
    /// Reject amount/flag conflicts before touching the backend
    pub fn validate(&self) -> GatewayResult<()> {
        if self.address.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "destination address is required".to_string(),
            ));
        }
        match (self.amount, self.send_all) {
            (Some(_), true) => Err(GatewayError::InvalidRequest(
                "amount and send_all are mutually exclusive".to_string(),
            )),
            (None, false) | (Some(0), false) => Err(GatewayError::InvalidRequest(
                "either a positive amount or send_all is required".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Parameters of [`crate::node::LightningNode::channel_open`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannel {
    /// Peer as `pubkey@host:port`
    pub node_uri: String,
    /// Channel size (sat)
    pub local_funding_amount: u64,
    /// Amount given to the peer (sat)
    #[serde(default)]
    pub push_amount: u64,
    /// Funding fee rate (sat/vbyte)
    pub sat_per_vbyte: Option<u64>,
    /// Keep the channel unannounced
    #[serde(default)]
    pub private: bool,
}

impl OpenChannel {
    /// Split `node_uri` into `(pubkey, host)`
    pub fn peer(&self) -> GatewayResult<(&str, &str)> {
        let (pubkey, host) = self.node_uri.split_once('@').ok_or_else(|| {
            GatewayError::InvalidRequest(format!(
                "node uri must be pubkey@host:port, got {}",
                self.node_uri
            ))
        })?;
        if pubkey.len() != 66 || hex::decode(pubkey).is_err() {
            return Err(GatewayError::InvalidRequest(format!(
                "invalid node public key: {}",
                pubkey
            )));
        }
        if host.is_empty() {
            return Err(GatewayError::InvalidRequest("missing peer host".to_string()));
        }
        if self.local_funding_amount == 0 {
            return Err(GatewayError::InvalidRequest(
                "local_funding_amount must be positive".to_string(),
            ));
        }
        Ok((pubkey, host))
    }
}

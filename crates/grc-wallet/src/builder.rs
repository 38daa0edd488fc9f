//! Transaction builder: coin selection, change, fee convergence and signing.
//!
//! 1. Add recipients (script + amount) and an optional payload
//! 2. [`TransactionBuilder::build`] selects inputs for the current fee
//!    guess, places change, signs, and measures the result; a fee below the
//!    requirement for that size restarts selection with the higher fee
//! 3. [`TransactionBuilder::commit`] records the transaction and broadcasts
//!    it, or [`TransactionBuilder::discard`] gives the change key back
//!
//! Nothing is written to the ledger until commit.

use std::collections::BTreeSet;

use rand::Rng;
use tracing::{debug, info, warn};

use grc_core::constants::{MAX_STANDARD_TX_SIZE, MIN_TX_FEE, STANDARD_BURN_AMOUNT};
use grc_core::money::{Amount, checked_add, money_range};
use grc_core::policy::{is_standard_size, required_fee};
use grc_core::script::Script;
use grc_core::traits::Broadcaster;
use grc_core::types::{Hash256, OutPoint, Transaction, TxInput, TxOutput};

use crate::coin_selection::{CandidateOutput, CoinControl, CoinSelector};
use crate::error::WalletError;
use crate::ledger::{ChainSnapshot, TransactionLedger, relay_wallet_tx};
use crate::store::WalletStore;
use crate::vault::{IsMine, KeyVault, ReservedKey};
use crate::wallet_tx::WalletTx;

/// Default cap on fee re-estimation rounds.
pub const DEFAULT_MAX_FEE_ITERATIONS: usize = 10;

/// A transaction recipient: locking script and amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub script_pubkey: Script,
    pub amount: Amount,
}

/// Application data carried by a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Payload {
    #[default]
    None,
    /// A user message. Costs a burn output of [`STANDARD_BURN_AMOUNT`].
    Message(String),
    /// An application contract. Inputs are chosen smallest-first.
    Contract(Vec<u8>),
}

impl Payload {
    pub fn burn_amount(&self) -> Amount {
        match self {
            Payload::Message(_) => STANDARD_BURN_AMOUNT,
            _ => 0,
        }
    }

    pub fn is_contract(&self) -> bool {
        matches!(self, Payload::Contract(_))
    }

    fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::None => Vec::new(),
            Payload::Message(text) => text.as_bytes().to_vec(),
            Payload::Contract(bytes) => bytes.clone(),
        }
    }
}

/// A signed transaction awaiting commit.
#[derive(Debug)]
pub struct BuiltTransaction {
    pub wtx: WalletTx,
    pub fee: Amount,
    /// Index of the change output, if one was added.
    pub change_position: Option<usize>,
    /// Fee estimation rounds used.
    pub iterations: usize,
    reserved: Option<ReservedKey>,
}

impl BuiltTransaction {
    pub fn txid(&self) -> Hash256 {
        self.wtx.txid
    }

    pub fn tx(&self) -> &Transaction {
        &self.wtx.tx
    }
}

/// Builder for wallet spends.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    recipients: Vec<Recipient>,
    payload: Payload,
    coin_control: Option<CoinControl>,
    fixed_inputs: Vec<OutPoint>,
    transaction_fee: Amount,
    max_fee_iterations: usize,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            recipients: Vec::new(),
            payload: Payload::None,
            coin_control: None,
            fixed_inputs: Vec::new(),
            transaction_fee: MIN_TX_FEE,
            max_fee_iterations: DEFAULT_MAX_FEE_ITERATIONS,
        }
    }

    pub fn add_recipient(&mut self, script_pubkey: Script, amount: Amount) -> &mut Self {
        self.recipients.push(Recipient { script_pubkey, amount });
        self
    }

    pub fn set_payload(&mut self, payload: Payload) -> &mut Self {
        self.payload = payload;
        self
    }

    pub fn set_coin_control(&mut self, coin_control: CoinControl) -> &mut Self {
        self.coin_control = Some(coin_control);
        self
    }

    /// Spend exactly these outputs. The fee must fit inside them.
    pub fn set_fixed_inputs(&mut self, inputs: Vec<OutPoint>) -> &mut Self {
        self.fixed_inputs = inputs;
        self
    }

    /// Fee per started kilobyte (default: [`MIN_TX_FEE`]).
    pub fn set_transaction_fee(&mut self, fee: Amount) -> &mut Self {
        self.transaction_fee = fee;
        self
    }

    pub fn set_max_fee_iterations(&mut self, iterations: usize) -> &mut Self {
        self.max_fee_iterations = iterations;
        self
    }

    fn value_out(&self) -> Result<Amount, WalletError> {
        if self.recipients.is_empty() {
            return Err(WalletError::BuildError("no recipients".into()));
        }
        let mut total: Amount = 0;
        for r in &self.recipients {
            if !money_range(r.amount) {
                return Err(WalletError::InvalidAmount(format!("recipient amount {} out of range", r.amount)));
            }
            total = checked_add(total, r.amount)
                .ok_or_else(|| WalletError::InvalidAmount("total amount overflow".into()))?;
        }
        checked_add(total, self.payload.burn_amount())
            .ok_or_else(|| WalletError::InvalidAmount("total amount overflow".into()))
    }

    /// Resolve caller-supplied inputs against the ledger.
    fn resolve_fixed_inputs(
        &self,
        ledger: &TransactionLedger,
        vault: &KeyVault,
        snapshot: &ChainSnapshot<'_>,
    ) -> Result<Vec<CandidateOutput>, WalletError> {
        let mut seen = BTreeSet::new();
        let mut coins = Vec::with_capacity(self.fixed_inputs.len());
        for outpoint in &self.fixed_inputs {
            if !seen.insert(*outpoint) {
                return Err(WalletError::BuildError(format!("input {outpoint} listed twice")));
            }
            let wtx = ledger
                .get(&outpoint.txid)
                .ok_or_else(|| WalletError::BuildError(format!("unknown input {outpoint}")))?;
            let out = wtx
                .tx
                .outputs
                .get(outpoint.index as usize)
                .ok_or_else(|| WalletError::BuildError(format!("unknown input {outpoint}")))?;
            if wtx.is_spent(outpoint.index as usize) {
                return Err(WalletError::BuildError(format!("input {outpoint} already spent")));
            }
            if vault.classify_script(&out.script_pubkey) != IsMine::Spendable {
                return Err(WalletError::BuildError(format!("input {outpoint} is not spendable")));
            }
            coins.push(CandidateOutput {
                outpoint: *outpoint,
                value: out.value,
                script_pubkey: out.script_pubkey.clone(),
                depth: snapshot.depth(wtx)?,
                from_me: wtx.from_me,
                tx_time: wtx.tx.time,
            });
        }
        Ok(coins)
    }

    /// Select, sign and size-check a spend.
    ///
    /// On error the reserved change key goes back to the pool and nothing
    /// else changes.
    pub fn build<R: Rng + ?Sized>(
        &self,
        selector: &CoinSelector,
        ledger: &TransactionLedger,
        vault: &mut KeyVault,
        snapshot: &ChainSnapshot<'_>,
        store: &dyn WalletStore,
        rng: &mut R,
    ) -> Result<BuiltTransaction, WalletError> {
        let mut reserved = None;
        let result = self.build_with_key(selector, ledger, vault, snapshot, store, rng, &mut reserved);
        match result {
            Ok(mut built) => {
                match reserved {
                    Some(key) if built.change_position.is_some() => built.reserved = Some(key),
                    Some(key) => vault.return_key(key),
                    None => {}
                }
                Ok(built)
            }
            Err(e) => {
                if let Some(key) = reserved {
                    vault.return_key(key);
                }
                warn!(error = %e, "transaction build failed");
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_with_key<R: Rng + ?Sized>(
        &self,
        selector: &CoinSelector,
        ledger: &TransactionLedger,
        vault: &mut KeyVault,
        snapshot: &ChainSnapshot<'_>,
        store: &dyn WalletStore,
        rng: &mut R,
        reserved: &mut Option<ReservedKey>,
    ) -> Result<BuiltTransaction, WalletError> {
        let value_out = self.value_out()?;
        let spend_time = snapshot.adjusted_time();
        let burn = self.payload.burn_amount();

        let fixed = if self.fixed_inputs.is_empty() {
            None
        } else {
            Some(self.resolve_fixed_inputs(ledger, vault, snapshot)?)
        };
        let candidates = match fixed {
            Some(_) => Vec::new(),
            None => selector.available_coins(ledger, vault, snapshot, self.coin_control.as_ref())?,
        };
        let has_selected = self.coin_control.as_ref().is_some_and(CoinControl::has_selected);
        let contract = !has_selected && self.payload.is_contract();

        let mut fee = self.transaction_fee;
        for iteration in 1..=self.max_fee_iterations {
            let target = checked_add(value_out, fee)
                .ok_or_else(|| WalletError::InvalidAmount("fee overflow".into()))?;

            let mut outputs: Vec<TxOutput> = self
                .recipients
                .iter()
                .map(|r| TxOutput::new(r.amount, r.script_pubkey.clone()))
                .collect();
            if burn > 0 {
                outputs.push(TxOutput::new(burn, Script::NullData(Vec::new())));
            }

            let inputs = match &fixed {
                Some(coins) => coins.clone(),
                None => {
                    selector
                        .select_coins(target, spend_time, &candidates, self.coin_control.as_ref(), contract, rng)?
                        .coins
                }
            };
            let value_in = inputs
                .iter()
                .try_fold(0, |acc, c| checked_add(acc, c.value))
                .ok_or_else(|| WalletError::InvalidAmount("input total out of range".into()))?;

            let mut change = value_in - value_out - fee;
            if fixed.is_some() && change < 0 {
                return Err(WalletError::InsufficientFixedInputs {
                    have: value_in,
                    need: target,
                });
            }
            if change > 0 && change < selector.cent {
                debug!(change, "folding sub-cent change into fee");
                fee += change;
                change = 0;
            }

            let mut change_position = None;
            if change > 0 {
                let script = self.change_script(&inputs, vault, store, snapshot.adjusted_time(), reserved)?;
                let position = rng.gen_range(0..outputs.len());
                outputs.insert(position, TxOutput::new(change, script));
                change_position = Some(position);
            }

            let mut tx = Transaction {
                version: 1,
                time: spend_time,
                inputs: inputs.iter().map(|c| TxInput::unsigned(c.outpoint)).collect(),
                outputs,
                lock_time: 0,
                payload: self.payload.to_bytes(),
            };
            for (index, coin) in inputs.iter().enumerate() {
                vault.sign_input(&mut tx, index, &coin.script_pubkey)?;
            }

            let bytes = tx.serialized_size()?;
            if !is_standard_size(bytes) {
                return Err(WalletError::OversizeTransaction {
                    size: bytes,
                    max: MAX_STANDARD_TX_SIZE,
                });
            }

            let required = required_fee(self.transaction_fee, &tx, bytes);
            debug!(iteration, bytes, fee, required, value_in, change, "fee estimate");
            if fee < required {
                fee = required;
                continue;
            }

            let mut wtx = WalletTx::new(tx)?;
            wtx.from_me = true;
            ledger.add_supporting(&mut wtx, snapshot)?;
            info!(txid = %wtx.txid, fee, inputs = inputs.len(), iterations = iteration, "transaction built");
            return Ok(BuiltTransaction {
                wtx,
                fee,
                change_position,
                iterations: iteration,
                reserved: None,
            });
        }
        Err(WalletError::FeeNotConverged {
            iterations: self.max_fee_iterations,
        })
    }

    /// Where change goes: the coin control destination, the first input
    /// address, or a reserved pool key.
    fn change_script(
        &self,
        inputs: &[CandidateOutput],
        vault: &mut KeyVault,
        store: &dyn WalletStore,
        now: u64,
        reserved: &mut Option<ReservedKey>,
    ) -> Result<Script, WalletError> {
        if let Some(control) = &self.coin_control {
            if let Some(dest) = &control.change_destination {
                return Ok(Script::from_destination(dest));
            }
            if control.return_change_to_input {
                if let Some(dest) = inputs.iter().find_map(|c| c.script_pubkey.destination()) {
                    debug!(%dest, "sending change to input address");
                    return Ok(Script::from_destination(&dest));
                }
            }
        }
        if reserved.is_none() {
            *reserved = Some(vault.reserve_key(store, now)?.ok_or(WalletError::KeypoolExhausted)?);
        }
        match reserved {
            Some(key) => Ok(Script::PayToKeyHash(key.key_id())),
            None => Err(WalletError::KeypoolExhausted),
        }
    }

    /// Record a built transaction and hand it to the network.
    ///
    /// The change key leaves the pool, the transaction enters the ledger
    /// (marking its inputs spent), then it goes to the mempool and is
    /// relayed. A mempool rejection leaves the ledger record in place.
    pub fn commit(
        built: BuiltTransaction,
        ledger: &mut TransactionLedger,
        vault: &mut KeyVault,
        snapshot: &ChainSnapshot<'_>,
        store: &dyn WalletStore,
        broadcaster: &dyn Broadcaster,
    ) -> Result<Hash256, WalletError> {
        if let Some(key) = &built.reserved {
            vault.keep_key(store, key)?;
        }
        let txid = built.wtx.txid;
        let tx = built.wtx.tx.clone();
        ledger.add_or_update(built.wtx, vault, snapshot, store)?;

        if !broadcaster.accept_to_mempool(&tx) {
            warn!(%txid, "committed transaction rejected by mempool");
            return Err(WalletError::MempoolRejected(txid.to_string()));
        }
        if let Some(wtx) = ledger.get(&txid) {
            relay_wallet_tx(wtx, snapshot.chain(), broadcaster)?;
        }
        info!(%txid, "transaction committed");
        Ok(txid)
    }

    /// Abandon a built transaction.
    pub fn discard(built: BuiltTransaction, vault: &mut KeyVault) {
        if let Some(key) = built.reserved {
            vault.return_key(key);
        }
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Transaction inspection.
//!
//! Lifts a raw transaction into an enriched form: the tokenized message it
//! carries (if any), its outputs classified into addresses, and its inputs
//! resolved against ancestor transactions. Classification into
//! request/response and relevance filtering both happen here.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use covenant_core::bitcoin::{Address, Hash32, Network, OutPoint, Transaction};
use covenant_core::protocol::{self, Action, RejectCode, WireError};

use crate::external::{ExternalError, TxRetriever};

/// Errors from inspection.
#[derive(Debug, Error)]
pub enum InspectError {
    /// An ancestor transaction could not be retrieved.
    #[error("ancestor {0} unavailable: {1}")]
    AncestorUnavailable(Hash32, ExternalError),

    /// An input spends an output that does not exist on its parent.
    #[error("input outpoint out of range")]
    BadOutpoint,

    /// An input's locking script matches no known template.
    #[error("input script template unknown")]
    UnknownInputTemplate,
}

/// A resolved transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectorInput {
    /// Address of the spent output.
    pub address: Address,
    /// Value of the spent output in satoshis.
    pub value: u64,
    /// The spent outpoint.
    pub outpoint: OutPoint,
}

/// A classified transaction output. Zero-value outputs are dropped; they
/// carry data, not money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectorOutput {
    /// The paying address.
    pub address: Address,
    /// Value in satoshis.
    pub value: u64,
    /// Index within the raw transaction.
    pub index: u32,
}

/// An enriched transaction.
#[derive(Debug, Clone)]
pub struct InspectorTx {
    /// Transaction id.
    pub txid: Hash32,
    /// The raw transaction.
    pub tx: Transaction,
    /// The tokenized message, when one decodes.
    pub action: Option<Action>,
    /// Set when the message decoded but failed validation.
    pub reject_code: Option<RejectCode>,
    /// Resolved inputs; empty until promoted.
    pub inputs: Vec<InspectorInput>,
    /// Classified outputs; empty until promoted.
    pub outputs: Vec<InspectorOutput>,
}

impl InspectorTx {
    /// Builds the base form: finds and validates the tokenized message but
    /// does not resolve inputs.
    #[must_use]
    pub fn from_tx(tx: Transaction, is_test: bool) -> Self {
        let txid = tx.txid();
        let mut action = None;
        let mut reject_code = None;

        for output in &tx.outputs {
            match protocol::deserialize(&output.lock_script, is_test) {
                Ok(decoded) => {
                    if let Err(e) = decoded.validate() {
                        warn!(tx = %txid, error = %e, "protocol message is invalid");
                        reject_code = Some(RejectCode::MsgMalformed);
                    }
                    action = Some(decoded);
                    break;
                }
                Err(WireError::UnknownProtocol) => continue,
                Err(e) => {
                    // The protocol id matched but the body is broken.
                    warn!(tx = %txid, error = %e, "malformed protocol message");
                    reject_code = Some(RejectCode::MsgMalformed);
                    break;
                }
            }
        }

        InspectorTx {
            txid,
            tx,
            action,
            reject_code,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Resolves inputs and outputs. Inputs require every ancestor to be
    /// retrievable and every spent script to match a known template.
    pub fn promote(
        &mut self,
        retriever: &dyn TxRetriever,
        net: Network,
    ) -> Result<(), InspectError> {
        self.parse_outputs(net);

        let mut inputs = Vec::with_capacity(self.tx.inputs.len());
        for input in &self.tx.inputs {
            let outpoint = input.previous_output;
            let parent = retriever
                .get_tx(&outpoint.txid)
                .map_err(|e| InspectError::AncestorUnavailable(outpoint.txid, e))?;
            let spent = parent
                .outputs
                .get(outpoint.index as usize)
                .ok_or(InspectError::BadOutpoint)?;
            let address = Address::from_locking_script(&spent.lock_script, net)
                .map_err(|_| InspectError::UnknownInputTemplate)?;
            inputs.push(InspectorInput {
                address,
                value: spent.value,
                outpoint,
            });
        }
        self.inputs = inputs;
        Ok(())
    }

    fn parse_outputs(&mut self, net: Network) {
        let mut outputs = Vec::new();
        for (index, output) in self.tx.outputs.iter().enumerate() {
            if output.value == 0 {
                continue;
            }
            match Address::from_locking_script(&output.lock_script, net) {
                Ok(address) => outputs.push(InspectorOutput {
                    address,
                    value: output.value,
                    index: index as u32,
                }),
                Err(_) => continue, // non-payto script
            }
        }
        self.outputs = outputs;
    }

    /// True when inputs and outputs are resolved.
    #[must_use]
    pub fn is_promoted(&self) -> bool {
        !self.inputs.is_empty()
    }

    /// True when the tx carries a protocol message.
    #[must_use]
    pub fn is_tokenized(&self) -> bool {
        self.action.is_some()
    }

    /// True when the message is in the request set.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.action.as_ref().is_some_and(|a| a.code().is_request())
    }

    /// True when the message is in the response set.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.action.as_ref().is_some_and(|a| a.code().is_response())
    }

    /// The contract addresses this tx concerns.
    ///
    /// For transfers these come from the per-asset contract indexes; for
    /// other requests the first output; for responses the first input.
    #[must_use]
    pub fn contract_addresses(&self) -> Vec<Address> {
        let Some(action) = &self.action else {
            return Vec::new();
        };

        match action {
            Action::Transfer(transfer) => {
                let mut addresses = Vec::new();
                for asset in &transfer.assets {
                    if let Some(output) = self.output_at(u32::from(asset.contract_index)) {
                        if !addresses.contains(&output.address) {
                            addresses.push(output.address.clone());
                        }
                    }
                }
                addresses
            }
            Action::Message(message) => message
                .receiver_indexes
                .iter()
                .filter_map(|i| self.output_at(u32::from(*i)))
                .map(|o| o.address.clone())
                .collect(),
            _ if action.code().is_request() => self
                .outputs
                .first()
                .map(|o| vec![o.address.clone()])
                .unwrap_or_default(),
            _ => self
                .inputs
                .first()
                .map(|i| vec![i.address.clone()])
                .unwrap_or_default(),
        }
    }

    /// The classified output at raw index `index`.
    #[must_use]
    pub fn output_at(&self, index: u32) -> Option<&InspectorOutput> {
        self.outputs.iter().find(|o| o.index == index)
    }

    /// True when any input or output touches `address`, or the message
    /// names it as a contract.
    #[must_use]
    pub fn is_relevant(&self, address: &Address) -> bool {
        self.inputs.iter().any(|i| i.address == *address)
            || self.outputs.iter().any(|o| o.address == *address)
            || self.contract_addresses().contains(address)
    }
}

/// The persisted form of an enriched tx, used by the tx cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorTxRecord {
    /// Raw transaction bytes.
    pub raw_tx: Vec<u8>,
    /// Resolved inputs.
    pub inputs: Vec<InspectorInput>,
    /// Reject code observed at decode time.
    pub reject_code: Option<u8>,
}

impl InspectorTx {
    /// Converts to the persisted form.
    #[must_use]
    pub fn to_record(&self) -> InspectorTxRecord {
        InspectorTxRecord {
            raw_tx: self.tx.serialize(),
            inputs: self.inputs.clone(),
            reject_code: self.reject_code.map(RejectCode::as_u8),
        }
    }

    /// Rebuilds from the persisted form, re-extracting the message and
    /// re-classifying outputs.
    pub fn from_record(
        record: &InspectorTxRecord,
        net: Network,
        is_test: bool,
    ) -> Result<Self, covenant_core::bitcoin::TxError> {
        let tx = Transaction::from_bytes(&record.raw_tx)?;
        let mut itx = InspectorTx::from_tx(tx, is_test);
        itx.parse_outputs(net);
        itx.inputs = record.inputs.clone();
        if let Some(code) = record.reject_code {
            itx.reject_code = RejectCode::from_u8(code);
        }
        Ok(itx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::MemoryTxSource;
    use covenant_core::bitcoin::{TxInput, TxOutput};
    use covenant_core::protocol::{ContractOffer, ContractTerms};

    fn addr(seed: u8) -> Address {
        Address::pkh([seed; 20], Network::Test)
    }

    fn funding_tx(to: &Address, value: u64) -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs.push(TxInput::new(OutPoint {
            txid: Hash32::hash(b"coinbase"),
            index: 0,
        }));
        tx.outputs.push(TxOutput {
            value,
            lock_script: to.locking_script(),
        });
        tx
    }

    fn offer_action() -> Action {
        Action::ContractOffer(ContractOffer {
            terms: ContractTerms {
                contract_name: "T".to_string(),
                contract_permissions: vec![0; 21],
                ..ContractTerms::default()
            },
        })
    }

    fn request_tx(parent: &Transaction, contract: &Address) -> Transaction {
        let mut tx = Transaction::new();
        tx.inputs.push(TxInput::new(OutPoint {
            txid: parent.txid(),
            index: 0,
        }));
        tx.outputs.push(TxOutput {
            value: 5_000,
            lock_script: contract.locking_script(),
        });
        tx.outputs.push(TxOutput {
            value: 0,
            lock_script: protocol::serialize(&offer_action(), true).unwrap(),
        });
        tx
    }

    #[test]
    fn extracts_message_and_classifies() {
        let sender = addr(1);
        let contract = addr(2);
        let parent = funding_tx(&sender, 10_000);
        let tx = request_tx(&parent, &contract);

        let source = MemoryTxSource::new();
        source.add(parent);

        let mut itx = InspectorTx::from_tx(tx, true);
        assert!(itx.is_tokenized());
        assert!(itx.is_request());
        assert!(!itx.is_response());
        assert!(itx.reject_code.is_none());

        itx.promote(&source, Network::Test).unwrap();
        assert!(itx.is_promoted());
        assert_eq!(itx.inputs[0].address, sender);
        // The data output is dropped; only the contract payment remains.
        assert_eq!(itx.outputs.len(), 1);
        assert_eq!(itx.outputs[0].address, contract);

        assert!(itx.is_relevant(&contract));
        assert!(itx.is_relevant(&sender));
        assert!(!itx.is_relevant(&addr(9)));
        assert_eq!(itx.contract_addresses(), vec![contract]);
    }

    #[test]
    fn missing_ancestor_fails_promotion() {
        let contract = addr(2);
        let parent = funding_tx(&addr(1), 10_000);
        let tx = request_tx(&parent, &contract);

        let source = MemoryTxSource::new();
        let mut itx = InspectorTx::from_tx(tx, true);
        assert!(matches!(
            itx.promote(&source, Network::Test),
            Err(InspectError::AncestorUnavailable(_, _))
        ));
    }

    #[test]
    fn non_tokenized_tx() {
        let parent = funding_tx(&addr(1), 1_000);
        let itx = InspectorTx::from_tx(parent, true);
        assert!(!itx.is_tokenized());
        assert!(!itx.is_request());
    }

    #[test]
    fn record_round_trip() {
        let sender = addr(1);
        let contract = addr(2);
        let parent = funding_tx(&sender, 10_000);
        let tx = request_tx(&parent, &contract);
        let source = MemoryTxSource::new();
        source.add(parent);

        let mut itx = InspectorTx::from_tx(tx, true);
        itx.promote(&source, Network::Test).unwrap();

        let record = itx.to_record();
        let back = InspectorTx::from_record(&record, Network::Test, true).unwrap();
        assert_eq!(back.txid, itx.txid);
        assert_eq!(back.inputs, itx.inputs);
        assert_eq!(back.outputs, itx.outputs);
        assert!(back.is_request());
    }
}

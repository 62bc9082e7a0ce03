//! Response-transaction assembly and signing.
//!
//! A response spends the request outputs paying the contract address (so
//! its signatures bind to the request), pays dust-value notification
//! outputs, carries exactly one data output with the response message, and
//! returns change to the contract. Fees come out of the change; the
//! contract fee, when configured, is its own output.

use thiserror::Error;

use covenant_core::bitcoin::{
    push_data, signature_hash, Address, PrivateKey, SigHashCache, SigHashType, Transaction,
    TxInput, TxOutput,
};
use covenant_core::protocol::{self, Action, WireError};

use crate::config::FeeConfig;
use crate::inspector::InspectorTx;

/// Bytes a signed P2PKH input contributes to the serialized tx.
const INPUT_SIZE: usize = 148;
/// Fixed overhead: version, counts, lock time.
const BASE_SIZE: usize = 10;

/// Errors from response assembly.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The request carries no outputs the contract can spend.
    #[error("request does not fund the contract")]
    NoFunding,

    /// Funding does not cover outputs plus fee.
    #[error("insufficient funding: have {have}, need {need}")]
    InsufficientFunding {
        /// Satoshis available.
        have: u64,
        /// Satoshis required.
        need: u64,
    },

    /// The response message failed to serialize.
    #[error("encode response: {0}")]
    Encode(#[from] WireError),

    /// Signing failed.
    #[error("sign response: {0}")]
    Sign(#[from] covenant_core::bitcoin::KeyError),
}

/// One notification output of a response.
#[derive(Debug, Clone)]
pub struct ResponseOutput {
    /// Receiving address.
    pub address: Address,
    /// Value; zero means the dust limit.
    pub value: u64,
}

/// Builds and signs the response transaction for a request.
///
/// `outputs` are the notification outputs in order (their indexes are what
/// response messages reference). `change` defaults to the contract
/// address.
pub fn build_response(
    request: &InspectorTx,
    contract: &Address,
    key: &PrivateKey,
    action: &Action,
    outputs: &[ResponseOutput],
    change: Option<&Address>,
    fees: &FeeConfig,
    fee_address: Option<&Address>,
    contract_fee: u64,
    exclude_outputs: &[u32],
    is_test: bool,
) -> Result<Transaction, BuildError> {
    // Spend every request output paying the contract, except the ones a
    // settlement has reserved.
    let funding: Vec<_> = request
        .outputs
        .iter()
        .filter(|o| o.address == *contract && !exclude_outputs.contains(&o.index))
        .collect();
    if funding.is_empty() {
        return Err(BuildError::NoFunding);
    }
    let total_in: u64 = funding.iter().map(|o| o.value).sum();

    let mut tx = Transaction::new();
    for output in &funding {
        tx.inputs.push(TxInput::new(output.outpoint_for(request)));
    }

    let mut total_out = 0u64;
    for spec in outputs {
        let value = if spec.value == 0 {
            fees.dust_limit
        } else {
            spec.value
        };
        total_out += value;
        tx.outputs.push(TxOutput {
            value,
            lock_script: spec.address.locking_script(),
        });
    }

    // The data output.
    tx.outputs.push(TxOutput {
        value: 0,
        lock_script: protocol::serialize(action, is_test)?,
    });

    if contract_fee > 0 {
        if let Some(fee_address) = fee_address {
            total_out += contract_fee;
            tx.outputs.push(TxOutput {
                value: contract_fee,
                lock_script: fee_address.locking_script(),
            });
        }
    }

    // Change output, estimated with itself included.
    let change_address = change.unwrap_or(contract);
    let change_script = change_address.locking_script();
    let estimated = estimate_size(&tx, 1 + change_script.len());
    let fee = fees.fee_rate * estimated as u64;

    let need = total_out + fee;
    if total_in < need {
        return Err(BuildError::InsufficientFunding {
            have: total_in,
            need,
        });
    }
    let change_value = total_in - need;
    if change_value >= fees.dust_limit {
        tx.outputs.push(TxOutput {
            value: change_value,
            lock_script: change_script,
        });
    }

    sign_inputs(&mut tx, &funding, contract, key)?;
    Ok(tx)
}

impl crate::inspector::InspectorOutput {
    fn outpoint_for(&self, request: &InspectorTx) -> covenant_core::bitcoin::OutPoint {
        covenant_core::bitcoin::OutPoint {
            txid: request.txid,
            index: self.index,
        }
    }
}

fn estimate_size(tx: &Transaction, change_script_len: usize) -> usize {
    let outputs: usize = tx.outputs.iter().map(|o| 13 + o.lock_script.len()).sum();
    BASE_SIZE + tx.inputs.len() * INPUT_SIZE + outputs + 13 + change_script_len
}

/// Signs every input as a P2PKH spend of the contract address.
///
/// One sighash cache serves all inputs, keeping the work linear in the
/// input count.
pub fn sign_inputs(
    tx: &mut Transaction,
    spent: &[&crate::inspector::InspectorOutput],
    contract: &Address,
    key: &PrivateKey,
) -> Result<(), BuildError> {
    let lock_script = contract.locking_script();
    let mut cache = SigHashCache::new();
    let hash_type = SigHashType::ALL.with(SigHashType::FORK_ID);

    let mut scripts = Vec::with_capacity(tx.inputs.len());
    for (index, output) in spent.iter().enumerate() {
        let digest = signature_hash(tx, index, &lock_script, output.value, hash_type, &mut cache)
            .expect("input index in range");
        let signature = key.sign(&digest)?;

        let mut sig_bytes = signature.to_der();
        sig_bytes.push(hash_type.0 as u8);

        let pubkey = key.public_key().to_bytes();
        let mut script = Vec::with_capacity(sig_bytes.len() + pubkey.len() + 4);
        script.extend(push_data(sig_bytes.len()));
        script.extend_from_slice(&sig_bytes);
        script.extend(push_data(pubkey.len()));
        script.extend_from_slice(&pubkey);
        scripts.push(script);
    }

    for (input, script) in tx.inputs.iter_mut().zip(scripts) {
        input.sig_script = script;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_core::bitcoin::{Hash32, Network, OutPoint};
    use covenant_core::protocol::{ContractFormation, ContractTerms, Timestamp};

    fn key(seed: u8) -> PrivateKey {
        let mut bytes = [seed; 32];
        bytes[0] = 1;
        PrivateKey::from_bytes(&bytes, Network::Test).unwrap()
    }

    fn fees() -> FeeConfig {
        FeeConfig {
            fee_address: String::new(),
            fee_rate: 1,
            dust_limit: 546,
        }
    }

    fn request_for(contract: &Address, funding: u64) -> InspectorTx {
        let sender = key(9).address();
        let mut parent = Transaction::new();
        parent.inputs.push(TxInput::new(OutPoint {
            txid: Hash32::hash(b"grandparent"),
            index: 0,
        }));
        parent.outputs.push(TxOutput {
            value: funding + 1_000,
            lock_script: sender.locking_script(),
        });

        let mut tx = Transaction::new();
        tx.inputs.push(TxInput::new(OutPoint {
            txid: parent.txid(),
            index: 0,
        }));
        tx.outputs.push(TxOutput {
            value: funding,
            lock_script: contract.locking_script(),
        });

        let mut itx = InspectorTx::from_tx(tx, true);
        itx.outputs.push(crate::inspector::InspectorOutput {
            address: contract.clone(),
            value: funding,
            index: 0,
        });
        itx.inputs.push(crate::inspector::InspectorInput {
            address: sender,
            value: funding + 1_000,
            outpoint: OutPoint {
                txid: parent.txid(),
                index: 0,
            },
        });
        itx
    }

    fn formation() -> Action {
        Action::ContractFormation(ContractFormation {
            terms: ContractTerms {
                contract_name: "C".to_string(),
                contract_permissions: vec![0; 21],
                ..ContractTerms::default()
            },
            contract_revision: 0,
            timestamp: Timestamp(1),
        })
    }

    #[test]
    fn builds_notification_data_fee_and_change() {
        let contract_key = key(1);
        let contract = contract_key.address();
        let fee_addr = key(2).address();
        let request = request_for(&contract, 50_000);

        let tx = build_response(
            &request,
            &contract,
            &contract_key,
            &formation(),
            &[ResponseOutput {
                address: contract.clone(),
                value: 0,
            }],
            None,
            &fees(),
            Some(&fee_addr),
            1_000,
            &[],
            true,
        )
        .unwrap();

        // notification + data + contract fee + change
        assert_eq!(tx.outputs.len(), 4);
        assert_eq!(tx.outputs[0].value, 546);
        assert_eq!(tx.outputs[1].value, 0);
        assert_eq!(tx.outputs[2].value, 1_000);
        assert!(tx.outputs[3].value > 0);

        // Value is conserved minus the miner fee.
        let total_out: u64 = tx.outputs.iter().map(|o| o.value).sum();
        assert!(total_out < 50_000);
        assert!(50_000 - total_out < 2_000);

        // Every input carries an unlock script.
        assert!(tx.inputs.iter().all(|i| !i.sig_script.is_empty()));
    }

    #[test]
    fn underfunded_request_is_rejected() {
        let contract_key = key(1);
        let contract = contract_key.address();
        let request = request_for(&contract, 100);

        let result = build_response(
            &request,
            &contract,
            &contract_key,
            &formation(),
            &[ResponseOutput {
                address: contract.clone(),
                value: 0,
            }],
            None,
            &fees(),
            None,
            0,
            &[],
            true,
        );
        assert!(matches!(
            result,
            Err(BuildError::InsufficientFunding { .. })
        ));
    }

    #[test]
    fn no_funding_output() {
        let contract_key = key(1);
        let other = key(3).address();
        let request = request_for(&other, 10_000);

        let result = build_response(
            &request,
            &contract_key.address(),
            &contract_key,
            &formation(),
            &[],
            None,
            &fees(),
            None,
            0,
            &[],
            true,
        );
        assert!(matches!(result, Err(BuildError::NoFunding)));
    }
}

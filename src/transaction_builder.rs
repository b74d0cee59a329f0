//! Unsigned transaction assembly, fee estimation and signing

use crate::address::AddressConverterChain;
use crate::address_manager::AddressManager;
use crate::constants::SEQUENCE_FINAL;
use crate::error::Result;
use crate::input_signer::{InputSigner, InputToSign};
use crate::script::p2pkh_script;
use crate::storage::WalletRecords;
use crate::types::*;
use crate::unspent::{SelectedUnspentOutputs, UnspentOutputProvider, UnspentOutputSelector};
use std::sync::Arc;

/// Change is always returned to a legacy key-hash output.
const CHANGE_SCRIPT_TYPE: ScriptType = ScriptType::P2PKH;

pub struct TransactionBuilder {
    converters: Arc<AddressConverterChain>,
    address_manager: Arc<AddressManager>,
    unspent_provider: UnspentOutputProvider,
    input_signer: InputSigner,
}

impl TransactionBuilder {
    pub fn new(
        converters: Arc<AddressConverterChain>,
        address_manager: Arc<AddressManager>,
        unspent_provider: UnspentOutputProvider,
        input_signer: InputSigner,
    ) -> Self {
        TransactionBuilder {
            converters,
            address_manager,
            unspent_provider,
            input_signer,
        }
    }

    fn select(
        &self,
        records: &WalletRecords,
        value: u64,
        fee_rate: u64,
        output_type: ScriptType,
        sender_pays: bool,
    ) -> Result<SelectedUnspentOutputs> {
        Ok(UnspentOutputSelector::select(
            self.unspent_provider.spendable(records),
            value,
            fee_rate,
            output_type,
            CHANGE_SCRIPT_TYPE,
            sender_pays,
        )?)
    }

    /// Fee: estimated fee for sending `value`, to `address` when known
    pub fn fee(&self, records: &WalletRecords, value: u64, fee_rate: u64, sender_pays: bool, address: Option<&str>) -> Result<u64> {
        let output_type = match address {
            Some(address) => self.converters.convert_string(address)?.script_type,
            None => ScriptType::P2PKH,
        };
        Ok(self.select(records, value, fee_rate, output_type, sender_pays)?.fee)
    }

    /// BuildTransaction: records × value × address × fee rate × sender pays → signed Transaction
    ///
    /// 1. Parse the recipient address into its locking script
    /// 2. Select spendable outputs covering value and fee
    /// 3. Recipient output first, then change to a fresh change key when not dust
    /// 4. Sign every input and recompute the hash
    pub fn build_transaction(
        &self,
        records: &WalletRecords,
        value: u64,
        address: &str,
        fee_rate: u64,
        sender_pays: bool,
    ) -> Result<Transaction> {
        let recipient = self.converters.convert_string(address)?;
        let selection = self.select(records, value, fee_rate, recipient.script_type, sender_pays)?;

        let mut outputs = vec![TransactionOutput::new(selection.recipient_value, recipient.locking_script()?, 0)];
        if let Some(change) = selection.change_value {
            let change_key = self.address_manager.change_public_key(records)?;
            outputs.push(TransactionOutput::new(change, p2pkh_script(&change_key.public_key_hash), 1));
        }

        let inputs_to_sign: Vec<InputToSign> = selection
            .outputs
            .iter()
            .map(|unspent| InputToSign {
                input: TransactionInput::new(unspent.outpoint(), Vec::new(), SEQUENCE_FINAL),
                previous_output: unspent.output.clone(),
                public_key: unspent.public_key.clone(),
            })
            .collect();
        let inputs = inputs_to_sign.iter().map(|to_sign| to_sign.input.clone()).collect();
        let mut transaction = Transaction::new(1, inputs, outputs, 0);

        let signatures = (0..inputs_to_sign.len())
            .map(|index| self.input_signer.sig_script_data(&transaction, &inputs_to_sign, index))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (input, signature) in transaction.inputs.iter_mut().zip(signatures) {
            input.signature_script = signature.signature_script();
            input.witness = signature.witness;
        }
        transaction.update_hash();
        Ok(transaction)
    }
}

//! Transactions
//!
//! An ordered batch of namespaced mutations, applied all-or-nothing by
//! `KeyValueDb::submit_transaction_sync`.

use std::collections::BTreeMap;

/// One staged mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Set { ns: String, key: Vec<u8>, value: Vec<u8> },
    Remove { ns: String, key: Vec<u8> },
    Merge { ns: String, key: Vec<u8>, operand: Vec<u8> },
}

impl TxnOp {
    pub fn namespace(&self) -> &str {
        match self {
            TxnOp::Set { ns, .. } | TxnOp::Remove { ns, .. } | TxnOp::Merge { ns, .. } => ns,
        }
    }
}

/// An atomic batch of key sets/removes/merges
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    ops: Vec<TxnOp>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage `key = value` in `ns`
    pub fn set(&mut self, ns: &str, key: &[u8], value: Vec<u8>) {
        self.ops.push(TxnOp::Set {
            ns: ns.to_string(),
            key: key.to_vec(),
            value,
        });
    }

    /// Stage removal of `key` in `ns`
    pub fn remove(&mut self, ns: &str, key: &[u8]) {
        self.ops.push(TxnOp::Remove {
            ns: ns.to_string(),
            key: key.to_vec(),
        });
    }

    /// Stage a merge of `operand` into `key`, resolved at commit by the
    /// namespace's merge operator
    pub fn merge(&mut self, ns: &str, key: &[u8], operand: Vec<u8>) {
        self.ops.push(TxnOp::Merge {
            ns: ns.to_string(),
            key: key.to_vec(),
            operand,
        });
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<TxnOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Replay this transaction's sets and removes for `ns` onto `view`
    ///
    /// Gives read-your-writes to code that stages several dependent
    /// mutations in one transaction. Merge operands are not applied.
    pub fn overlay(&self, ns: &str, view: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        for op in &self.ops {
            match op {
                TxnOp::Set { ns: op_ns, key, value } if op_ns == ns => {
                    view.insert(key.clone(), value.clone());
                }
                TxnOp::Remove { ns: op_ns, key } if op_ns == ns => {
                    view.remove(key);
                }
                _ => {}
            }
        }
    }
}

//! Backend drivers implementing the storage contract.

pub mod bigkv;
pub mod memory;
pub mod netkv;
pub mod slate;
pub mod tikv;

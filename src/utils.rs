//! Identity generation

use bech32::Bech32m;
use uuid7::uuid7;

pub const ACCOUNT_PREFIX: &str = "acct_";
pub const PRODUCT_PREFIX: &str = "prod_";
pub const VARIANT_PREFIX: &str = "item_";
pub const TRANSACTION_PREFIX: &str = "txn_";

// construct a unique id then encode using bech32, the hrp names the kind of record
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

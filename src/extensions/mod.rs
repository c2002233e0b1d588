//! Built-in extensions and the name registry
//!
//! Extensions are compiled in and selected by name from the `[extensions]`
//! config section. One instance per name is shared by every hook list that
//! names it.

pub mod aes;
pub mod dns;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::FileConfig;
use crate::core::crypt;
use crate::core::hooks::{Extension, ExtensionChain};
use crate::error::ProxyError;

pub use aes::AesExtension;
pub use dns::DnsExtension;

/// Names accepted in `[extensions]`
pub const REGISTERED: &[&str] = &["dns", "aes"];

fn aes_key(config: &FileConfig) -> Result<String, ProxyError> {
    match (&config.aes.encrypted_key, &config.aes.key) {
        (Some(sealed), _) => {
            let master = config.crypt.key.as_deref().ok_or_else(|| {
                ProxyError::Config("[aes] encrypted_key requires [crypt] key".into())
            })?;
            Ok(crypt::decrypt_to_string(sealed, master)?)
        }
        (None, Some(key)) if !key.is_empty() => Ok(key.clone()),
        _ => Err(ProxyError::Config(
            "aes extension needs [aes] key or encrypted_key".into(),
        )),
    }
}

fn instantiate(name: &str, config: &FileConfig) -> Result<Arc<dyn Extension>, ProxyError> {
    match name {
        "dns" => Ok(Arc::new(DnsExtension::new(config.dns.clone()))),
        "aes" => Ok(Arc::new(AesExtension::new(aes_key(config)?, &config.aes.endpoints))),
        other => Err(ProxyError::Config(format!(
            "unknown extension '{}', expected one of {:?}",
            other, REGISTERED
        ))),
    }
}

/// Resolve the configured hook lists into a chain. Unknown names fail here,
/// at startup.
pub fn build_chain(config: &FileConfig) -> Result<ExtensionChain, ProxyError> {
    let mut instances: HashMap<String, Arc<dyn Extension>> = HashMap::new();
    let mut resolve = |names: &[String]| -> Result<Vec<Arc<dyn Extension>>, ProxyError> {
        names
            .iter()
            .map(|name| {
                let name = name.trim();
                if let Some(ext) = instances.get(name) {
                    return Ok(Arc::clone(ext));
                }
                let ext = instantiate(name, config)?;
                instances.insert(name.to_string(), Arc::clone(&ext));
                Ok(ext)
            })
            .collect()
    };

    let pre_connect = resolve(&config.extensions.pre_connect)?;
    let pre_out = resolve(&config.extensions.pre_out)?;
    let pre_in = resolve(&config.extensions.pre_in)?;
    Ok(ExtensionChain::new(pre_connect, pre_out, pre_in))
}

//! Marketplace orders
//!
//! Supply orders (app, dataset, workerpool) are published by resource owners;
//! a request order is published by the requester. Every order is signed once
//! and never mutated afterwards: the signature covers the order's canonical
//! hash, so any change invalidates it.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::{keccak256, recover_signer, EvmSigner};
use crate::error::{BrokerError, CoreError, Result};
use crate::tag::ConfidentialityTag;
use crate::types::{Address, Bytes32};

/// Canonical hash of an order: `keccak256(kind ‖ JCS(order without "sign"))`.
fn canonical_order_hash<T: Serialize + ?Sized>(kind: &str, order: &T) -> Result<Bytes32> {
    let mut value = serde_json::to_value(order)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("sign");
    }
    let canonical =
        serde_jcs::to_vec(&value).map_err(|e| CoreError::Serialization(e.to_string()))?;
    let mut material = Vec::with_capacity(kind.len() + canonical.len());
    material.extend_from_slice(kind.as_bytes());
    material.extend_from_slice(&canonical);
    Ok(keccak256(material))
}

fn random_salt() -> Bytes32 {
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut salt);
    Bytes32::new(salt)
}

/// Behaviour shared by all signed orders.
pub trait Order: Serialize {
    /// Domain label mixed into the order hash.
    const KIND: &'static str;

    fn resource(&self) -> &Address;
    fn price(&self) -> u64;
    fn volume(&self) -> u64;
    fn tag(&self) -> ConfidentialityTag;
    fn signature(&self) -> &str;

    fn order_hash(&self) -> Result<Bytes32> {
        canonical_order_hash(Self::KIND, self)
    }

    /// Address that signed this order.
    fn signer(&self) -> Result<Address> {
        recover_signer(&self.order_hash()?, self.signature())
    }
}

macro_rules! impl_order {
    ($ty:ty, $kind:literal, $resource:ident, $price:ident) => {
        impl Order for $ty {
            const KIND: &'static str = $kind;

            fn resource(&self) -> &Address {
                &self.$resource
            }

            fn price(&self) -> u64 {
                self.$price
            }

            fn volume(&self) -> u64 {
                self.volume
            }

            fn tag(&self) -> ConfidentialityTag {
                self.tag
            }

            fn signature(&self) -> &str {
                &self.sign
            }
        }

        impl $ty {
            /// Sign the order, consuming the unsigned draft.
            pub fn sign(mut self, signer: &EvmSigner) -> Result<Self> {
                self.sign = String::new();
                let hash = self.order_hash()?;
                self.sign = signer.sign(&hash)?;
                Ok(self)
            }
        }
    };
}

/// Offer to run an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppOrder {
    pub app: Address,
    pub app_price: u64,
    pub volume: u64,
    pub tag: ConfidentialityTag,
    pub salt: Bytes32,
    pub sign: String,
}

impl AppOrder {
    pub fn new(app: Address, app_price: u64, volume: u64, tag: ConfidentialityTag) -> Self {
        Self {
            app,
            app_price,
            volume,
            tag,
            salt: random_salt(),
            sign: String::new(),
        }
    }
}

impl_order!(AppOrder, "warden.apporder", app, app_price);

/// Offer to provide a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetOrder {
    pub dataset: Address,
    pub dataset_price: u64,
    pub volume: u64,
    pub tag: ConfidentialityTag,
    pub salt: Bytes32,
    pub sign: String,
}

impl DatasetOrder {
    pub fn new(dataset: Address, dataset_price: u64, volume: u64, tag: ConfidentialityTag) -> Self {
        Self {
            dataset,
            dataset_price,
            volume,
            tag,
            salt: random_salt(),
            sign: String::new(),
        }
    }
}

impl_order!(DatasetOrder, "warden.datasetorder", dataset, dataset_price);

/// Offer of worker capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerpoolOrder {
    pub workerpool: Address,
    pub workerpool_price: u64,
    pub volume: u64,
    pub tag: ConfidentialityTag,
    pub category: u64,
    pub trust: u64,
    pub salt: Bytes32,
    pub sign: String,
}

impl WorkerpoolOrder {
    pub fn new(
        workerpool: Address,
        workerpool_price: u64,
        volume: u64,
        tag: ConfidentialityTag,
        category: u64,
    ) -> Self {
        Self {
            workerpool,
            workerpool_price,
            volume,
            tag,
            category,
            trust: 0,
            salt: random_salt(),
            sign: String::new(),
        }
    }
}

impl_order!(WorkerpoolOrder, "warden.workerpoolorder", workerpool, workerpool_price);

/// CLI-style parameters handed to the application inside the enclave
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestParams {
    #[serde(rename = "iexec_args", default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,

    #[serde(rename = "iexec_input_files", default, skip_serializing_if = "Vec::is_empty")]
    pub input_files: Vec<String>,

    /// Secret slot index → secret name provisioned to the enclave.
    #[serde(rename = "iexec_secrets", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<u32, String>,

    #[serde(rename = "iexec_result_encryption", default)]
    pub result_encryption: bool,
}

/// Signed request to execute an application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOrder {
    pub app: Address,
    pub app_max_price: u64,
    /// Zero address when the workload needs no dataset.
    pub dataset: Address,
    pub dataset_max_price: u64,
    /// Zero address when any workerpool may run the workload.
    pub workerpool: Address,
    pub workerpool_max_price: u64,
    pub requester: Address,
    pub beneficiary: Address,
    pub volume: u64,
    pub tag: ConfidentialityTag,
    pub category: u64,
    pub trust: u64,
    pub params: RequestParams,
    pub salt: Bytes32,
    pub sign: String,
}

impl_order!(RequestOrder, "warden.requestorder", app, app_max_price);

impl RequestOrder {
    pub fn requires_dataset(&self) -> bool {
        !self.dataset.is_zero()
    }

    pub fn requires_workerpool(&self) -> bool {
        !self.workerpool.is_zero()
    }
}

/// Input for [`crate::broker::ConfidentialJobBroker::create_signed_request_order`]
#[derive(Debug, Clone, Default)]
pub struct RequestOrderParams {
    pub app: Option<Address>,
    pub dataset: Option<Address>,
    pub workerpool: Option<Address>,
    pub category: u64,
    pub app_max_price: u64,
    pub dataset_max_price: u64,
    pub workerpool_max_price: u64,
    pub tag: ConfidentialityTag,
    /// Defaults to 1 when zero.
    pub volume: u64,
    pub trust: u64,
    /// Defaults to the requester when absent.
    pub beneficiary: Option<Address>,
    pub params: RequestParams,
}

impl RequestOrderParams {
    pub fn for_app(app: Address) -> Self {
        Self {
            app: Some(app),
            volume: 1,
            ..Default::default()
        }
    }

    pub fn with_dataset(mut self, dataset: Address, max_price: u64) -> Self {
        self.dataset = Some(dataset);
        self.dataset_max_price = max_price;
        self
    }

    pub fn with_workerpool(mut self, workerpool: Address) -> Self {
        self.workerpool = Some(workerpool);
        self
    }

    pub fn with_prices(mut self, app: u64, dataset: u64, workerpool: u64) -> Self {
        self.app_max_price = app;
        self.dataset_max_price = dataset;
        self.workerpool_max_price = workerpool;
        self
    }

    pub fn with_tag(mut self, tag: ConfidentialityTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.params.args = Some(args.into());
        self
    }

    pub fn with_category(mut self, category: u64) -> Self {
        self.category = category;
        self
    }

    /// Build the unsigned request order for `requester`.
    pub(crate) fn into_order(self, requester: &Address) -> std::result::Result<RequestOrder, BrokerError> {
        let app = self.app.ok_or(BrokerError::MissingField("app"))?;
        Ok(RequestOrder {
            app,
            app_max_price: self.app_max_price,
            dataset: self.dataset.unwrap_or_else(Address::zero),
            dataset_max_price: self.dataset_max_price,
            workerpool: self.workerpool.unwrap_or_else(Address::zero),
            workerpool_max_price: self.workerpool_max_price,
            requester: requester.clone(),
            beneficiary: self.beneficiary.unwrap_or_else(|| requester.clone()),
            volume: self.volume.max(1),
            tag: self.tag,
            category: self.category,
            trust: self.trust,
            params: self.params,
            salt: random_salt(),
            sign: String::new(),
        })
    }
}

//! Confidential job broker
//!
//! Builds the requester's signed order, picks the cheapest compatible supply
//! orders and asks the marketplace to match them into a deal. Every check
//! that can fail does so before the single state-changing call.

use std::sync::Arc;
use tracing::{info, warn};

use crate::crypto::EvmSigner;
use crate::deal::BrokeredDeal;
use crate::error::BrokerError;
use crate::market::Marketplace;
use crate::order::{AppOrder, DatasetOrder, Order, RequestOrder, RequestOrderParams, WorkerpoolOrder};
use crate::tag::ConfidentialityTag;
use crate::types::Address;

pub use crate::deal::compute_task_id;

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Best supply orders found for one workload
#[derive(Debug, Clone, PartialEq)]
pub struct MatchingOrders {
    pub app: AppOrder,
    pub dataset: Option<DatasetOrder>,
    pub workerpool: Option<WorkerpoolOrder>,
}

/// Cheapest order; the first one wins ties.
fn cheapest<O: Order>(orders: Vec<O>) -> Option<O> {
    orders.into_iter().fold(None, |best, order| match best {
        Some(current) if current.price() <= order.price() => Some(current),
        _ => Some(order),
    })
}

fn check_price(kind: &'static str, price: u64, max: u64) -> Result<()> {
    if price > max {
        return Err(BrokerError::PriceExceeded { kind, price, max });
    }
    Ok(())
}

fn check_tag(kind: &'static str, offered: ConfidentialityTag, required: ConfidentialityTag) -> Result<()> {
    if !offered.satisfies(required) {
        return Err(BrokerError::TagMismatch {
            kind,
            required,
            offered,
        });
    }
    Ok(())
}

/// Brokers confidential jobs on behalf of one requester key
pub struct ConfidentialJobBroker {
    market: Arc<dyn Marketplace>,
    requester: EvmSigner,
}

impl std::fmt::Debug for ConfidentialJobBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfidentialJobBroker")
            .field("requester", self.requester.address())
            .finish_non_exhaustive()
    }
}

impl ConfidentialJobBroker {
    pub fn new(market: Arc<dyn Marketplace>, requester: EvmSigner) -> Self {
        Self { market, requester }
    }

    pub fn requester(&self) -> &Address {
        self.requester.address()
    }

    /// Build and sign a request order with the requester key.
    pub fn create_signed_request_order(&self, params: RequestOrderParams) -> Result<RequestOrder> {
        let order = params.into_order(self.requester.address())?;
        let order = order.sign(&self.requester)?;
        info!(
            "Signed request order for app {} (tag {}, volume {})",
            order.app, order.tag, order.volume
        );
        Ok(order)
    }

    /// Query the orderbook for the cheapest orders compatible with `tag`.
    ///
    /// A named workerpool restricts the capacity query to that pool. A missing
    /// app order is fatal; missing dataset or workerpool orders are reported
    /// as `None` and left for [`Self::broker_deal`] to judge.
    pub async fn fetch_matching_orders(
        &self,
        app: &Address,
        dataset: Option<&Address>,
        workerpool: Option<&Address>,
        tag: ConfidentialityTag,
        category: u64,
    ) -> Result<MatchingOrders> {
        let app_orders = self.market.app_orders(app, tag).await?;
        let app_order = cheapest(
            app_orders
                .into_iter()
                .filter(|o| o.tag.satisfies(tag))
                .collect(),
        )
        .ok_or_else(|| BrokerError::NoAppOrder(app.clone()))?;

        let dataset_order = match dataset {
            Some(dataset) => {
                let orders = self.market.dataset_orders(dataset, tag).await?;
                let best = cheapest(orders.into_iter().filter(|o| o.tag.satisfies(tag)).collect());
                if best.is_none() {
                    warn!("No dataset order for {} under tag {}", dataset, tag);
                }
                best
            }
            None => None,
        };

        let workerpool_orders = self.market.workerpool_orders(category, tag, workerpool).await?;
        let workerpool_order = cheapest(
            workerpool_orders
                .into_iter()
                .filter(|o| o.tag.satisfies(tag))
                .collect(),
        );
        if workerpool_order.is_none() {
            match workerpool {
                Some(workerpool) => warn!(
                    "No order from workerpool {} in category {} under tag {}",
                    workerpool, category, tag
                ),
                None => warn!("No workerpool order in category {} under tag {}", category, tag),
            }
        }

        Ok(MatchingOrders {
            app: app_order,
            dataset: dataset_order,
            workerpool: workerpool_order,
        })
    }

    /// Validate `orders` against `request` and match them into a deal.
    pub async fn broker_deal(
        &self,
        request: &RequestOrder,
        orders: &MatchingOrders,
    ) -> Result<BrokeredDeal> {
        self.validate(request, orders)?;

        let deal = self
            .market
            .match_orders(
                request,
                &orders.app,
                orders.dataset.as_ref(),
                orders.workerpool.as_ref(),
            )
            .await?;

        info!("Brokered deal {} with {} task(s)", deal.deal_id, deal.volume);
        Ok(deal)
    }

    fn validate(&self, request: &RequestOrder, orders: &MatchingOrders) -> Result<()> {
        let app = &orders.app;
        if app.app != request.app {
            return Err(BrokerError::ResourceMismatch {
                expected: request.app.clone(),
                found: app.app.clone(),
            });
        }
        check_price("app", app.app_price, request.app_max_price)?;
        check_tag("app", app.tag, request.tag)?;

        if request.requires_dataset() {
            let dataset = orders
                .dataset
                .as_ref()
                .ok_or(BrokerError::MissingOrder { kind: "dataset" })?;
            if dataset.dataset != request.dataset {
                return Err(BrokerError::ResourceMismatch {
                    expected: request.dataset.clone(),
                    found: dataset.dataset.clone(),
                });
            }
            check_price("dataset", dataset.dataset_price, request.dataset_max_price)?;
            check_tag("dataset", dataset.tag, request.tag)?;
        }

        if request.requires_workerpool() && orders.workerpool.is_none() {
            return Err(BrokerError::MissingOrder { kind: "workerpool" });
        }
        if let Some(workerpool) = &orders.workerpool {
            if request.requires_workerpool() && workerpool.workerpool != request.workerpool {
                return Err(BrokerError::ResourceMismatch {
                    expected: request.workerpool.clone(),
                    found: workerpool.workerpool.clone(),
                });
            }
            check_price(
                "workerpool",
                workerpool.workerpool_price,
                request.workerpool_max_price,
            )?;
            check_tag("workerpool", workerpool.tag, request.tag)?;
        }

        Ok(())
    }
}

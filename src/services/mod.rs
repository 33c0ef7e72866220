// Order placement and status transitions
pub mod orders;

// Pricing: VAT, shipping tariff, rush surcharge
pub mod fees;

// Availability checks and the guarded stock commit
pub mod stock;

// Payment attempt ledger
pub mod ledger;

// Invoices for settled charges
pub mod invoicing;

// Stored payment methods
pub mod payment_methods;

// The engine tying the above together
pub mod lifecycle;

pub use fees::{FeeCalculator, OrderQuote, PricedLine};
pub use invoicing::InvoicingService;
pub use ledger::PaymentLedgerService;
pub use lifecycle::{
    OrderLifecycleEngine, PaymentInitiation, PlaceOrderRequest, Reconciliation, RefundOutcome,
};
pub use orders::{DeliveryDetails, OrderService};
pub use payment_methods::{CreatePaymentMethodRequest, PaymentMethodService};
pub use stock::{LineRequest, StockService};

pub mod delivery_info;
pub mod invoice;
pub mod order;
pub mod order_line;
pub mod payment_method;
pub mod payment_transaction;
pub mod product;

/// Typed entity records and the codec that builds them from untyped row images
pub mod codec;
mod entities;

pub use codec::Image;
pub use entities::{
    Customer, Entity, EntityKind, EntityRecord, Order, OrderItem, Product, PRIMARY_KEY_FIELD,
};

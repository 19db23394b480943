use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use super::codec::Image;
use crate::error::DecodeError;
use crate::store::AffinityKey;

/// Primary key field shared by every synchronized table
pub const PRIMARY_KEY_FIELD: &str = "id";

/// A typed, store-ready projection of one row image
pub trait Entity: Sized + Into<EntityRecord> {
    const KIND: EntityKind;

    fn decode(image: &Image<'_>) -> Result<Self, DecodeError>;

    fn key(&self) -> i64;

    /// Parent this record must be colocated with
    fn affinity(&self) -> Option<AffinityKey> {
        None
    }
}

/// Entity kinds the engine knows how to synchronize
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Customer,
    Product,
    Order,
    OrderItem,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Customer,
        EntityKind::Product,
        EntityKind::Order,
        EntityKind::OrderItem,
    ];

    /// Store collection records of this kind are written to
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customers",
            EntityKind::Product => "products",
            EntityKind::Order => "orders",
            EntityKind::OrderItem => "order_items",
        }
    }

    /// Source table names recognized for this kind, besides aliases from config
    pub fn table_names(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Customer => &["customers", "customer"],
            EntityKind::Product => &["products", "product"],
            EntityKind::Order => &["orders", "order"],
            EntityKind::OrderItem => &["order_items", "order_item", "orderitems", "orderitem"],
        }
    }

    pub fn from_collection(collection: &str) -> Option<EntityKind> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection() == collection)
    }

    /// Decode an upsert image into the typed record for this kind
    pub fn decode(&self, image: &Value) -> Result<EntityRecord, DecodeError> {
        let image = Image::new(image)?;
        Ok(match self {
            EntityKind::Customer => Customer::decode(&image)?.into(),
            EntityKind::Product => Product::decode(&image)?.into(),
            EntityKind::Order => Order::decode(&image)?.into(),
            EntityKind::OrderItem => OrderItem::decode(&image)?.into(),
        })
    }

    /// Recover only the primary key, as needed for deletes
    pub fn decode_key(&self, image: &Value) -> Result<i64, DecodeError> {
        Image::new(image)?.required_i64(PRIMARY_KEY_FIELD)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Customer {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
}

impl Entity for Customer {
    const KIND: EntityKind = EntityKind::Customer;

    fn decode(image: &Image<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: image.required_i64(PRIMARY_KEY_FIELD)?,
            name: image.optional_string("name")?,
            email: image.optional_string("email")?,
            city: image.optional_string("city")?,
        })
    }

    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    pub id: i64,
    pub name: Option<String>,
    pub price: Option<f64>,
    pub stock: Option<i64>,
}

impl Entity for Product {
    const KIND: EntityKind = EntityKind::Product;

    fn decode(image: &Image<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: image.required_i64(PRIMARY_KEY_FIELD)?,
            name: image.optional_string("name")?,
            price: image.optional_f64("price")?,
            stock: image.optional_i64("stock")?,
        })
    }

    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: i64,
    /// Affinity key: colocated with the owning customer
    pub customer_id: i64,
    pub status: Option<String>,
    pub total: Option<f64>,
    pub order_date: Option<DateTime<Utc>>,
}

impl Entity for Order {
    const KIND: EntityKind = EntityKind::Order;

    fn decode(image: &Image<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: image.required_i64(PRIMARY_KEY_FIELD)?,
            customer_id: image.required_i64("customer_id")?,
            status: image.optional_string("status")?,
            total: image.optional_f64("total")?,
            order_date: image.optional_datetime("order_date")?,
        })
    }

    fn key(&self) -> i64 {
        self.id
    }

    fn affinity(&self) -> Option<AffinityKey> {
        Some(AffinityKey::new(
            EntityKind::Customer.collection(),
            self.customer_id,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderItem {
    pub id: i64,
    /// Affinity key: colocated with the owning order
    pub order_id: i64,
    pub product_id: Option<i64>,
    pub quantity: Option<i64>,
    pub unit_price: Option<f64>,
}

impl Entity for OrderItem {
    const KIND: EntityKind = EntityKind::OrderItem;

    fn decode(image: &Image<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: image.required_i64(PRIMARY_KEY_FIELD)?,
            order_id: image.required_i64("order_id")?,
            product_id: image.optional_i64("product_id")?,
            quantity: image.optional_i64("quantity")?,
            unit_price: image.optional_f64("unit_price")?,
        })
    }

    fn key(&self) -> i64 {
        self.id
    }

    fn affinity(&self) -> Option<AffinityKey> {
        Some(AffinityKey::new(EntityKind::Order.collection(), self.order_id))
    }
}

/// One decoded record of any kind, as handed to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityRecord {
    Customer(Customer),
    Product(Product),
    Order(Order),
    OrderItem(OrderItem),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Customer(_) => Customer::KIND,
            EntityRecord::Product(_) => Product::KIND,
            EntityRecord::Order(_) => Order::KIND,
            EntityRecord::OrderItem(_) => OrderItem::KIND,
        }
    }

    pub fn collection(&self) -> &'static str {
        self.kind().collection()
    }

    pub fn key(&self) -> i64 {
        match self {
            EntityRecord::Customer(r) => r.key(),
            EntityRecord::Product(r) => r.key(),
            EntityRecord::Order(r) => r.key(),
            EntityRecord::OrderItem(r) => r.key(),
        }
    }

    pub fn affinity(&self) -> Option<AffinityKey> {
        match self {
            EntityRecord::Customer(r) => r.affinity(),
            EntityRecord::Product(r) => r.affinity(),
            EntityRecord::Order(r) => r.affinity(),
            EntityRecord::OrderItem(r) => r.affinity(),
        }
    }
}

impl From<Customer> for EntityRecord {
    fn from(r: Customer) -> Self {
        EntityRecord::Customer(r)
    }
}

impl From<Product> for EntityRecord {
    fn from(r: Product) -> Self {
        EntityRecord::Product(r)
    }
}

impl From<Order> for EntityRecord {
    fn from(r: Order) -> Self {
        EntityRecord::Order(r)
    }
}

impl From<OrderItem> for EntityRecord {
    fn from(r: OrderItem) -> Self {
        EntityRecord::OrderItem(r)
    }
}

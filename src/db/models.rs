use chrono::NaiveDateTime;
use diesel::pg::Pg;
use diesel::prelude::*;
use serde::Serialize;

use super::schema::{
    achievements, activity_messages, collections, items, pending_rewards, settled_rewards, users,
};
use super::types::Address;

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = users, check_for_backend(Pg))]
pub struct User {
    pub id: i64,
    pub address: Address,
    pub telegram_user_id: Option<i64>,
    pub rating: i64,
    pub awards_count: i32,
    pub last_award_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = collections, check_for_backend(Pg))]
pub struct Collection {
    pub id: i64,
    pub address: Address,
    pub owner_address: Option<Address>,
    pub next_item_index: i64,
    pub content_uri: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub default_weight: i32,
    pub minting_until: Option<NaiveDateTime>,
}

/// Collection state as last read from the chain
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = collections, check_for_backend(Pg))]
pub struct NewCollection {
    pub address: Address,
    pub owner_address: Option<Address>,
    pub next_item_index: i64,
    pub content_uri: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub content_json: Option<serde_json::Value>,

    /// Only set when registering a collection. `None` keeps what is stored
    pub default_weight: Option<i32>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = items, check_for_backend(Pg))]
pub struct Item {
    pub id: i64,
    pub address: Address,
    pub collection_id: i64,
    pub index: i64,
    pub owner_address: Option<Address>,
    pub content_uri: Option<String>,
    pub content_ref: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub weight: i32,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = items, check_for_backend(Pg))]
pub struct NewItem {
    pub address: Address,
    pub collection_id: i64,
    pub index: i64,
    pub owner_address: Option<Address>,
    pub content_uri: Option<String>,
    pub content_ref: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub content_json: Option<serde_json::Value>,
    pub weight: i32,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = achievements, check_for_backend(Pg))]
pub struct Achievement {
    pub id: i64,
    pub content_ref: String,
    pub threshold: i64,
    pub weight: i32,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = pending_rewards, check_for_backend(Pg))]
pub struct PendingReward {
    pub id: i64,
    pub user_address: Address,
    pub collection_address: Address,
    pub content_ref: String,
    pub approved_by_user: bool,
    pub processed: bool,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = pending_rewards, check_for_backend(Pg))]
pub struct NewPendingReward {
    pub user_address: Address,
    pub collection_address: Address,
    pub content_ref: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = settled_rewards, check_for_backend(Pg))]
pub struct NewSettledReward {
    pub user_id: i64,
    pub item_id: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = activity_messages, check_for_backend(Pg))]
pub struct NewActivityMessage {
    pub telegram_user_id: i64,
    pub chat_id: i64,
    pub message_id: i64,
}

/// Approved rewards still waiting for a mint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backlog {
    pub count: i64,
    pub oldest: Option<NaiveDateTime>,
}

/// Item a settlement credits
#[derive(Debug, Clone)]
pub enum SettlementItem {
    Stored(i64),

    /// Not synced yet. Inserted in the same transaction as the settlement
    New(NewItem),
}

#[derive(Debug, Clone)]
pub struct Settlement {
    pub user_address: Address,
    pub item: SettlementItem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Settled {
        reward_id: i64,
        user_id: i64,
        rating: i64,
    },
    AlreadySettled,
    UnknownUser,
}

use diesel::{
    deserialize::{self, FromSql, FromSqlRow},
    expression::AsExpression,
    pg::{Pg, PgValue},
    serialize::{self, Output, ToSql},
    sql_types::Text,
};
use serde::{Deserialize, Serialize};

use crate::chain;

/// Chain address stored in its raw `wc:hex` form
#[derive(
    Debug, Deserialize, Serialize, AsExpression, FromSqlRow, Clone, Copy, PartialEq, Eq, Hash,
)]
#[diesel(sql_type=Text)]
pub struct Address(pub chain::Address);

impl From<chain::Address> for Address {
    fn from(value: chain::Address) -> Self {
        Self(value)
    }
}

impl From<Address> for chain::Address {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl ToSql<Text, Pg> for Address {
    fn to_sql(&self, out: &mut Output<'_, '_, Pg>) -> serialize::Result {
        <String as ToSql<Text, Pg>>::to_sql(&self.0.to_string(), &mut out.reborrow())
    }
}

impl FromSql<Text, Pg> for Address {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        let s = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(Address(s.parse()?))
    }
}

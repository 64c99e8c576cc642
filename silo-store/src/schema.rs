//! Table and column naming for the message table

use serde::Deserialize;

fn default_table() -> String {
    "silo".to_string()
}

macro_rules! column_default {
    ($($name:ident => $value:literal),* $(,)?) => {
        $(
            fn $name() -> String {
                $value.to_string()
            }
        )*
    };
}

column_default! {
    default_mid => "id",
    default_from => "src_addr",
    default_to => "dst_addr",
    default_uri_user => "username",
    default_uri_host => "domain",
    default_body => "body",
    default_ctype => "ctype",
    default_exp_time => "exp_time",
    default_inc_time => "inc_time",
    default_snd_time => "snd_time",
}

/// Names of the message table and its columns
///
/// Every name can be overridden from configuration, e.g.
/// ```ron
/// schema: (
///     table: "offline_messages",
///     mid: "message_id",
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Schema {
    #[serde(default = "default_table")]
    pub table: String,
    /// Message identifier, assigned by the store on insert
    #[serde(default = "default_mid")]
    pub mid: String,
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default = "default_to")]
    pub to: String,
    /// User part of the owner's address of record
    #[serde(default = "default_uri_user")]
    pub uri_user: String,
    /// Host part of the owner's address of record
    #[serde(default = "default_uri_host")]
    pub uri_host: String,
    #[serde(default = "default_body")]
    pub body: String,
    #[serde(default = "default_ctype")]
    pub ctype: String,
    /// Unix time after which the row may be evicted
    #[serde(default = "default_exp_time")]
    pub exp_time: String,
    /// Unix time the message was stored
    #[serde(default = "default_inc_time")]
    pub inc_time: String,
    /// Unix time a reminder is due, 0 when none is scheduled
    #[serde(default = "default_snd_time")]
    pub snd_time: String,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            table: default_table(),
            mid: default_mid(),
            from: default_from(),
            to: default_to(),
            uri_user: default_uri_user(),
            uri_host: default_uri_host(),
            body: default_body(),
            ctype: default_ctype(),
            exp_time: default_exp_time(),
            inc_time: default_inc_time(),
            snd_time: default_snd_time(),
        }
    }
}

impl Schema {
    /// Every data column, in table order (the identifier excluded)
    pub fn data_columns(&self) -> [&str; 9] {
        [
            self.from.as_str(),
            self.to.as_str(),
            self.uri_user.as_str(),
            self.uri_host.as_str(),
            self.body.as_str(),
            self.ctype.as_str(),
            self.exp_time.as_str(),
            self.inc_time.as_str(),
            self.snd_time.as_str(),
        ]
    }
}

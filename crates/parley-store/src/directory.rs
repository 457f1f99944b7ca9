//! Per-identity ancillary records: published public keys, push device
//! tokens and nicknames.  All are upserts where the last write wins; no
//! history is kept.

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};

use parley_shared::types::Identity;

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_public_key(&self, identity: &Identity, public_key: &str, at: f64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO public_keys (identity, public_key, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET public_key = excluded.public_key,
                                                 updated_at = excluded.updated_at",
            params![identity.as_str(), public_key, at],
        )?;
        Ok(())
    }

    pub fn get_public_key(&self, identity: &Identity) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT public_key FROM public_keys WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn upsert_device_token(&self, identity: &Identity, token: &str, at: f64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO device_tokens (identity, token, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET token = excluded.token,
                                                 updated_at = excluded.updated_at",
            params![identity.as_str(), token, at],
        )?;
        Ok(())
    }

    pub fn get_device_token(&self, identity: &Identity) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT token FROM device_tokens WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_nickname(&self, identity: &Identity, nickname: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (identity, nickname) VALUES (?1, ?2)
             ON CONFLICT(identity) DO UPDATE SET nickname = excluded.nickname",
            params![identity.as_str(), nickname],
        )?;
        Ok(())
    }

    pub fn nicknames(&self) -> Result<HashMap<Identity, String>> {
        let mut stmt = self.conn().prepare("SELECT identity, nickname FROM users")?;
        let rows = stmt.query_map([], |row| {
            let identity: String = row.get(0)?;
            let nickname: String = row.get(1)?;
            Ok((Identity::new(identity), nickname))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (identity, nickname) = row?;
            map.insert(identity, nickname);
        }
        Ok(map)
    }
}

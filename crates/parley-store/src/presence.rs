//! Presence heartbeats keyed by room.

use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn record_heartbeat(&self, room: &str, last_active: f64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO presence (room, last_active) VALUES (?1, ?2)
             ON CONFLICT(room) DO UPDATE SET last_active = excluded.last_active",
            params![room, last_active],
        )?;
        Ok(())
    }

    pub fn last_active(&self, room: &str) -> Result<Option<f64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT last_active FROM presence WHERE room = ?1",
                params![room],
                |row| row.get(0),
            )
            .optional()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.last_active("admin_heartbeat").unwrap(), None);
        db.record_heartbeat("admin_heartbeat", 10.0).unwrap();
        db.record_heartbeat("admin_heartbeat", 15.5).unwrap();
        assert_eq!(db.last_active("admin_heartbeat").unwrap(), Some(15.5));
    }
}

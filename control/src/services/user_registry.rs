use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::config::UserSeed;
use crate::types::User;

pub fn insert_user(conn: &Connection, user: &User) -> Result<()> {
    conn.execute(
        "INSERT INTO users (username, password_hash, is_admin, networks) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![
            user.username,
            user.password_hash,
            user.is_admin,
            serde_json::to_string(&user.networks)?,
        ],
    )
    .context("Failed to insert user")?;

    Ok(())
}

/// Get a user by name; `None` when absent
pub fn find_user(conn: &Connection, username: &str) -> Result<Option<User>> {
    let row = conn
        .query_row(
            "SELECT username, password_hash, is_admin, networks FROM users WHERE username = ?1",
            rusqlite::params![username],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .context("Failed to get user")?;

    match row {
        Some((username, password_hash, is_admin, networks)) => Ok(Some(User {
            username,
            password_hash,
            is_admin,
            networks: serde_json::from_str(&networks).context("Corrupt user network list")?,
        })),
        None => Ok(None),
    }
}

/// Insert users from configuration that are not stored yet
pub fn seed_users(conn: &Connection, seeds: &[UserSeed]) -> Result<usize> {
    let mut inserted = 0;
    for seed in seeds {
        if find_user(conn, &seed.username)?.is_none() {
            insert_user(
                conn,
                &User {
                    username: seed.username.clone(),
                    password_hash: seed.password_hash.clone(),
                    is_admin: seed.is_admin,
                    networks: seed.networks.clone(),
                },
            )?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

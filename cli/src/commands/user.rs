use anyhow::{Result, bail};

use super::App;

pub(crate) fn cmd_user_set(app: &App, user_id: &str, json: bool) -> Result<()> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        bail!("User id cannot be empty");
    }
    app.engine.sign_in(user_id)?;

    if json {
        println!("{}", serde_json::json!({ "user_id": user_id }));
    } else {
        println!("Signed in as {user_id}");
    }
    Ok(())
}

pub(crate) fn cmd_user_show(app: &App, json: bool) -> Result<()> {
    let user = app.engine.user_id();
    if json {
        println!("{}", serde_json::json!({ "user_id": user }));
    } else if let Some(user) = user {
        println!("{user}");
    } else {
        eprintln!("No user signed in. Use `fitstat user set <id>`.");
    }
    Ok(())
}

pub(crate) fn cmd_user_clear(app: &App, json: bool) -> Result<()> {
    app.engine.sign_out()?;
    if json {
        println!("{}", serde_json::json!({ "user_id": null }));
    } else {
        println!("Signed out");
    }
    Ok(())
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use mlua::prelude::*;
use mlua::DeserializeOptions;

use crate::logger;
use crate::model::Scenario;
use crate::validate;

/// Scenario written as a Lua script returning the scenario table.
pub const SCRIPT_FILE: &str = "main.lua";
/// Scenario serialized as JSON.
pub const JSON_FILE: &str = "scenario.json";

/// One discovered scenario directory.
#[derive(Debug, Clone)]
pub struct ScenarioEntry {
    /// Directory relative to the scenarios root, `/`-separated.
    pub name: String,
    /// Reference bitmaps are resolved against this directory.
    pub dir: PathBuf,
    pub source: PathBuf,
    pub scenario: Option<Arc<Scenario>>,
    pub error: Option<String>,
}

impl ScenarioEntry {
    pub fn is_loaded(&self) -> bool {
        self.scenario.is_some()
    }
}

/// Recursively find scenario definition files under `dir`. A directory holding
/// a definition is not searched further; `main.lua` wins over `scenario.json`.
pub fn find_scenario_files(dir: &Path) -> Vec<PathBuf> {
    let mut results = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else { return results };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
    paths.sort();

    for path in paths {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        let script = path.join(SCRIPT_FILE);
        let json = path.join(JSON_FILE);
        if script.is_file() {
            results.push(script);
        } else if json.is_file() {
            results.push(json);
        } else {
            results.extend(find_scenario_files(&path));
        }
    }
    results
}

/// scenarios/daily/farm/main.lua -> daily/farm
pub fn derive_scenario_name(path: &Path, root: &Path) -> String {
    let dir = path.parent().unwrap_or(path);
    let rel = dir.strip_prefix(root).unwrap_or(dir);
    rel.to_string_lossy().replace('\\', "/")
}

/// Discover and load every scenario under `root`. Broken scenarios are kept
/// with their error so they can be shown.
pub fn load_scenarios(root: &Path) -> Vec<ScenarioEntry> {
    let mut entries = Vec::new();
    for source in find_scenario_files(root) {
        let name = derive_scenario_name(&source, root);
        let dir = source.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
        let (scenario, error) = match load_scenario(&source) {
            Ok(s) => (Some(Arc::new(s)), None),
            Err(e) => {
                logger::error_p("loader", &format!("failed to load {}: {:#}", name, e));
                (None, Some(format!("{:#}", e)))
            }
        };
        entries.push(ScenarioEntry { name, dir, source, scenario, error });
    }
    entries
}

/// Load and validate one definition file.
pub fn load_scenario(path: &Path) -> Result<Scenario> {
    let mut scenario = match path.file_name().and_then(|n| n.to_str()) {
        Some(SCRIPT_FILE) => load_script(path)?,
        _ => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
    };
    let Scenario { id, events, .. } = &mut scenario;
    for event in events.iter_mut() {
        event.scenario_id = *id;
    }
    validate::validate(&scenario)?;
    Ok(scenario)
}

fn lua_err(e: mlua::Error) -> anyhow::Error {
    anyhow!("{}", e)
}

fn load_script(path: &Path) -> Result<Scenario> {
    let lua = Lua::new();
    let tag = path
        .parent()
        .and_then(|d| d.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    register_globals(&lua, &tag).map_err(lua_err)?;

    // require() resolves modules next to the script
    if let Some(dir) = path.parent() {
        let dir_str = dir.to_string_lossy();
        let pkg: LuaTable = lua.globals().get("package").map_err(lua_err)?;
        pkg.set("path", format!("{}/?.lua;{}/?/init.lua", dir_str, dir_str)).map_err(lua_err)?;
    }

    let code = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: LuaValue = lua.load(&code).set_name(path.to_string_lossy()).eval().map_err(lua_err)?;
    if !value.is_table() {
        return Err(anyhow!("{} must return a table, got {}", path.display(), value.type_name()));
    }
    // Helper functions left in the table are ignored.
    let options = DeserializeOptions::new().deny_unsupported_types(false);
    lua.from_value_with(value, options).map_err(lua_err)
}

/// Register the S.* helper table.
fn register_globals(lua: &Lua, tag: &str) -> mlua::Result<()> {
    let s_table = lua.create_table()?;

    // S.area(left, top, width, height)
    let area_fn = lua.create_function(|lua, (l, t, w, h): (i32, i32, u32, u32)| {
        let area = lua.create_table()?;
        area.set("left", l)?;
        area.set("top", t)?;
        area.set("width", w)?;
        area.set("height", h)?;
        Ok(area)
    })?;
    s_table.set("area", area_fn)?;

    // S.point(x, y)
    let point_fn = lua.create_function(|lua, (x, y): (i32, i32)| {
        let point = lua.create_table()?;
        point.set("x", x)?;
        point.set("y", y)?;
        Ok(point)
    })?;
    s_table.set("point", point_fn)?;

    // S.log(msg), prefixed with the scenario folder name
    let tag = tag.to_string();
    if !tag.is_empty() {
        logger::register_prefix(&tag, logger::COLOR_BLUE);
    }
    let log_fn = lua.create_function(move |_, msg: String| {
        if tag.is_empty() {
            logger::info(&msg);
        } else {
            logger::info_p(&tag, &msg);
        }
        Ok(())
    })?;
    s_table.set("log", log_fn)?;

    lua.globals().set("S", s_table)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, ConditionKind, EventKind, Target, TriggerCondition};
    use crate::types::{Point, Rect};

    const FARM_LUA: &str = r#"
local buttons = require("buttons")

local function click_on(id)
  return { on = "on_condition", condition_id = id, offset = S.point(0, 5) }
end

S.log("building farm")

return {
  id = 7,
  name = "farm",
  detection_quality = 800,
  events = {
    {
      id = 1, name = "ok button", kind = "image", operator = "all", priority = 2,
      conditions = {
        { id = 10, type = "image", path = buttons.ok, area = S.area(10, 20, 30, 40), threshold = 90 },
      },
      actions = {
        { id = 100, type = "click", target = click_on(10) },
      },
    },
    {
      id = 2, name = "every minute", kind = "trigger", operator = "any",
      conditions = {
        { id = 20, type = "trigger", trigger = "timer_reached", duration_ms = 60000, restart = true },
      },
      actions = {
        { id = 200, type = "change_counter", counter = "minutes", operation = "add", operand = { number = 1 } },
      },
    },
  },
  helper = click_on,
}
"#;

    const TAP_JSON: &str = r#"{
  "id": 3,
  "name": "tap",
  "events": [{
    "id": 1, "name": "tap", "kind": "trigger", "operator": "all",
    "conditions": [{ "id": 1, "type": "trigger", "trigger": "counter_reached",
                     "counter": "taps", "comparison": "lower", "operand": { "number": 3 } }],
    "actions": [{ "id": 1, "type": "click", "target": { "on": "fixed", "x": 5, "y": 6 } }]
  }]
}"#;

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn lua_scenario_uses_helpers_and_modules() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("farm").join(SCRIPT_FILE);
        write(&script, FARM_LUA);
        write(&dir.path().join("farm").join("buttons.lua"), r#"return { ok = "ok.png" }"#);

        let s = load_scenario(&script).unwrap();
        assert_eq!(s.id, 7);
        assert_eq!(s.detection_quality, 800);
        assert!(s.events.iter().all(|e| e.scenario_id == 7));

        let ok = s.event(1).unwrap();
        assert_eq!(ok.kind, EventKind::Image);
        let ConditionKind::Image(image) = &ok.conditions[0].kind else { panic!("not an image condition") };
        assert_eq!(image.path, "ok.png");
        assert_eq!(image.area, Rect::new(10, 20, 30, 40));
        assert!(image.should_be_detected);
        let ActionKind::Click(click) = &ok.actions[0].kind else { panic!("not a click") };
        assert_eq!(click.target, Target::OnCondition { condition_id: 10, offset: Some(Point::new(0, 5)) });

        let timer = s.event(2).unwrap();
        assert!(matches!(
            timer.conditions[0].kind,
            ConditionKind::Trigger(TriggerCondition::TimerReached { duration_ms: 60000, restart: true })
        ));
    }

    #[test]
    fn script_must_return_a_table() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join(SCRIPT_FILE);
        write(&script, "return 42");
        let err = load_scenario(&script).unwrap_err().to_string();
        assert!(err.contains("must return a table"), "{err}");
    }

    #[test]
    fn invalid_graph_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(JSON_FILE);
        write(&path, r#"{ "id": 1, "name": "empty", "events": [{ "id": 1, "name": "e", "kind": "trigger", "operator": "all" }] }"#);
        let err = format!("{:#}", load_scenario(&path).unwrap_err());
        assert!(err.contains("event 1"), "{err}");
    }

    #[test]
    fn discovery_keeps_broken_entries_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(&root.join("daily").join("tap").join(JSON_FILE), TAP_JSON);
        write(&root.join("broken").join(SCRIPT_FILE), "return {");
        write(&root.join(".git").join("hooks").join(JSON_FILE), TAP_JSON);
        write(&root.join("notes").join("readme.txt"), "nothing here");

        let entries = load_scenarios(root);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["broken", "daily/tap"]);

        assert!(!entries[0].is_loaded());
        assert!(entries[0].error.is_some());
        assert!(entries[1].is_loaded());
        assert_eq!(entries[1].dir, root.join("daily").join("tap"));
        assert_eq!(entries[1].scenario.as_ref().unwrap().name, "tap");
    }

    #[test]
    fn script_wins_over_json() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a").join(JSON_FILE), TAP_JSON);
        write(&dir.path().join("a").join(SCRIPT_FILE), "return {}");
        let files = find_scenario_files(dir.path());
        assert_eq!(files, vec![dir.path().join("a").join(SCRIPT_FILE)]);
    }
}

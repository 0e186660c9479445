use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::error::{PortalError, Result};

/// An edit session over `server.properties`.
///
/// The raw lines are the source of truth for persistence so comments, blank
/// lines and odd formatting survive a round trip. The key/value map is derived
/// from them on load and kept in step by [`ServerProperties::set`].
#[derive(Debug, Clone)]
pub struct ServerProperties {
    path: PathBuf,
    raw_lines: Vec<String>,
    values: BTreeMap<String, String>,
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    if line.trim().is_empty() || line.trim_start().starts_with('#') {
        return None;
    }
    let (k, v) = line.split_once('=')?;
    Some((k.trim(), v.trim()))
}

impl ServerProperties {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PortalError::NotFound(path.display().to_string()));
            }
            Err(e) => {
                return Err(PortalError::Properties(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self::parse(path, &text))
    }

    fn parse(path: PathBuf, text: &str) -> Self {
        let mut raw_lines = Vec::new();
        let mut values = BTreeMap::new();
        for line in text.lines() {
            if let Some((k, v)) = parse_line(line) {
                values.insert(k.to_string(), v.to_string());
            }
            raw_lines.push(line.to_string());
        }
        Self {
            path,
            raw_lines,
            values,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn lines(&self) -> &[String] {
        &self.raw_lines
    }

    /// Sets `key` in memory. Only the first line starting with `key=` is
    /// rewritten; later duplicates keep their old text. Without such a line
    /// the pair is appended.
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());

        let prefix = format!("{key}=");
        let line = format!("{key}={value}");
        match self.raw_lines.iter_mut().find(|l| l.starts_with(&prefix)) {
            Some(existing) => *existing = line,
            None => self.raw_lines.push(line),
        }
    }

    /// Overwrites the file with the raw lines, each terminated by `\n`.
    pub fn save(&self) -> Result<()> {
        let mut out = String::with_capacity(self.raw_lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.raw_lines {
            out.push_str(line);
            out.push('\n');
        }
        std::fs::write(&self.path, out)
            .map_err(|e| PortalError::Properties(format!("write {}: {e}", self.path.display())))?;
        tracing::info!(path = %self.path.display(), lines = self.raw_lines.len(), "server properties saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# Bedrock server properties
server-name=Dedicated Server
gamemode = survival
   # indented comment=not a key

difficulty=easy
allow-cheats=false
gamemode=creative
not a property line
";

    fn write_sample(dir: &Path) -> PathBuf {
        let p = dir.join("server.properties");
        std::fs::write(&p, SAMPLE).unwrap();
        p
    }

    #[test]
    fn load_parses_pairs_and_keeps_every_line() {
        let dir = tempfile::tempdir().unwrap();
        let props = ServerProperties::load(write_sample(dir.path())).unwrap();

        assert_eq!(props.lines().len(), SAMPLE.lines().count());
        assert_eq!(props.get("server-name"), Some("Dedicated Server"));
        assert_eq!(props.get("difficulty"), Some("easy"));
        // Later duplicates win in the map.
        assert_eq!(props.get("gamemode"), Some("creative"));
        assert_eq!(props.get("# indented comment"), None);
        assert_eq!(props.get("not a property line"), None);
        assert_eq!(
            props.keys().collect::<Vec<_>>(),
            ["allow-cheats", "difficulty", "gamemode", "server-name"]
        );
    }

    #[test]
    fn value_may_contain_equals() {
        let props = ServerProperties::parse(PathBuf::from("x"), "motd=a=b\n");
        assert_eq!(props.get("motd"), Some("a=b"));
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerProperties::load(dir.path().join("server.properties")).unwrap_err();
        assert!(matches!(err, PortalError::NotFound(_)), "{err}");
    }

    #[test]
    fn set_new_key_appends_exactly_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut props = ServerProperties::load(write_sample(dir.path())).unwrap();
        let before = props.lines().to_vec();

        props.set("level-name", "world2");

        assert_eq!(props.lines().len(), before.len() + 1);
        assert_eq!(&props.lines()[..before.len()], before.as_slice());
        assert_eq!(props.lines().last().unwrap(), "level-name=world2");
        assert_eq!(props.get("level-name"), Some("world2"));
    }

    #[test]
    fn set_existing_key_replaces_only_first_occurrence() {
        let text = "difficulty=easy\n# c\ndifficulty=hard\n";
        let mut props = ServerProperties::parse(PathBuf::from("x"), text);

        props.set("difficulty", "peaceful");

        assert_eq!(
            props.lines(),
            ["difficulty=peaceful", "# c", "difficulty=hard"]
        );
        assert_eq!(props.get("difficulty"), Some("peaceful"));
    }

    #[test]
    fn set_matches_prefix_ordinally() {
        // "gamemode = survival" does not start with "gamemode=", the later line does.
        let dir = tempfile::tempdir().unwrap();
        let mut props = ServerProperties::load(write_sample(dir.path())).unwrap();
        props.set("gamemode", "adventure");

        assert!(props.lines().contains(&"gamemode = survival".to_string()));
        assert!(props.lines().contains(&"gamemode=adventure".to_string()));
        assert!(!props.lines().contains(&"gamemode=creative".to_string()));
    }

    #[test]
    fn save_then_load_round_trips_except_edited_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let mut props = ServerProperties::load(&path).unwrap();
        props.set("difficulty", "hard");
        props.set("level-name", "world2");
        props.save().unwrap();

        let reloaded = ServerProperties::load(&path).unwrap();
        let expected: Vec<String> = SAMPLE
            .lines()
            .map(|l| {
                if l == "difficulty=easy" {
                    "difficulty=hard".to_string()
                } else {
                    l.to_string()
                }
            })
            .chain(std::iter::once("level-name=world2".to_string()))
            .collect();
        assert_eq!(reloaded.lines(), expected.as_slice());
        assert_eq!(reloaded.get("difficulty"), Some("hard"));
        assert_eq!(reloaded.get("level-name"), Some("world2"));
    }

    #[test]
    fn get_and_set_never_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample(dir.path());
        let mut props = ServerProperties::load(&path).unwrap();
        props.set("difficulty", "hard");
        let _ = props.get("difficulty");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn crlf_lines_are_read_without_terminators() {
        let props = ServerProperties::parse(PathBuf::from("x"), "a=1\r\nb=2\r\n");
        assert_eq!(props.lines(), ["a=1", "b=2"]);
        assert_eq!(props.get("a"), Some("1"));
    }
}

use std::fs::File;
use std::io::Write;

/// Application logic run inside node and command processes.
///
/// `action` runs once in every node process, right after it registers; its
/// result becomes the node's `R:` response. `command` runs in a freshly forked
/// process whose standard streams are the client's terminal; its return value
/// is the exit code.
pub trait Plan {
    /// Loads whatever node `name` preloads, reporting each dependency file.
    fn action(&mut self, name: &str, features: &mut FeatureReporter) -> Result<(), String>;

    /// Runs command `name` with the client's arguments.
    fn command(&mut self, name: &str, args: &[String]) -> i32;
}

/// Write side of a node's feature pipe.
///
/// Every reported path becomes one `F:<path>` line; write errors are ignored
/// because a closed pipe means the supervisor is gone anyway.
#[derive(Debug)]
pub struct FeatureReporter {
    pipe: Option<File>,
}

impl FeatureReporter {
    pub(crate) fn new(pipe: File) -> Self {
        Self { pipe: Some(pipe) }
    }

    /// A reporter that drops everything.
    pub fn disconnected() -> Self {
        Self { pipe: None }
    }

    /// Reports one dependency file.
    pub fn report(&mut self, path: &str) {
        let path = path.trim();
        if path.is_empty() || path.contains('\n') {
            return;
        }
        if let Some(pipe) = self.pipe.as_mut() {
            let _ = pipe.write_all(format!("F:{path}\n").as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn reports_one_line_per_path() {
        let (r, w) = nix::unistd::pipe().unwrap();
        let mut reporter = FeatureReporter::new(File::from(w));
        reporter.report("/app/config/boot.rb");
        reporter.report("  ");
        reporter.report("two\nlines");
        reporter.report(" /app/lib/code.rb ");
        drop(reporter);

        let mut out = String::new();
        File::from(r).read_to_string(&mut out).unwrap();
        assert_eq!(out, "F:/app/config/boot.rb\nF:/app/lib/code.rb\n");
    }

    #[test]
    fn disconnected_reporter_drops_paths() {
        let mut reporter = FeatureReporter::disconnected();
        reporter.report("/app/x.rb");
    }
}

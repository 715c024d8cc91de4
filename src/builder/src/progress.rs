//! Build progress printed to stdout.

/// Progress lines for one stage.
#[derive(Debug, Clone)]
pub struct Progress {
    quiet: bool,
    prefix: String,
}

impl Progress {
    /// `stage_index` is zero-based; the `[i/n]` prefix is only used for
    /// multi-stage builds.
    pub fn new(quiet: bool, stage_index: usize, stage_count: usize) -> Self {
        let prefix = if stage_count > 1 {
            format!("[{}/{}] ", stage_index + 1, stage_count)
        } else {
            String::new()
        };
        Self { quiet, prefix }
    }

    pub fn step(&self, number: usize, total: usize, text: &str) {
        if !self.quiet {
            println!("{}STEP {}/{}: {}", self.prefix, number, total, text);
        }
    }

    pub fn cache_hit(&self, image_id: &str) {
        if !self.quiet {
            println!("--> Using cache {}", image_id);
        }
    }

    pub fn commit(&self, name: Option<&str>) {
        if !self.quiet {
            println!("{}COMMIT {}", self.prefix, name.unwrap_or(""));
        }
    }

    pub fn image_id(&self, image_id: &str) {
        if !self.quiet {
            println!("--> {}", short_id(image_id));
        }
    }
}

/// First 12 characters of an image ID.
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    id.get(..12).unwrap_or(id)
}

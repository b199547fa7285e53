/// A docker image reference, split into its addressing parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Split an image reference the way docker resolves it.
    ///
    /// The awkward case is `localhost:5000/app:v1`: a colon followed by a
    /// slash belongs to the registry's port, not the tag, so the tag is
    /// the text after the last colon with no slash behind it.
    pub fn parse(image: &str) -> Self {
        let (rest, digest) = match image.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (image, None),
        };

        let (rest, tag) = match rest.rfind(':') {
            Some(pos) if !rest[pos + 1..].contains('/') => {
                (&rest[..pos], Some(rest[pos + 1..].to_string()))
            }
            _ => (rest, None),
        };

        // The first path component is a registry host only if it looks
        // like one: a dot, a port, or the literal "localhost".
        let (registry, name) = match rest.split_once('/') {
            Some((host, remainder))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (Some(host.to_string()), remainder.to_string())
            }
            _ => (None, rest.to_string()),
        };

        Self {
            registry,
            name,
            tag,
            digest,
        }
    }

    /// Whether the reference pins a version at all. An untagged parent
    /// image silently floats on `latest`.
    pub fn is_tagged(&self) -> bool {
        self.tag.is_some() || self.digest.is_some()
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Scan a Dockerfile for the parent images named by its `FROM` clauses.
///
/// Multi-stage aware: `AS stage` aliases are recorded and a later
/// `FROM stage` referencing an earlier build stage is not reported as an
/// image. `--platform` flags are skipped.
pub fn parent_images(dockerfile: &str) -> Vec<ImageRef> {
    let mut stages: Vec<String> = Vec::new();
    let mut parents = Vec::new();

    for raw_line in dockerfile.lines() {
        let mut tokens = raw_line.split_whitespace();
        match tokens.next() {
            Some(token) if token.eq_ignore_ascii_case("FROM") => {}
            _ => continue,
        }

        let mut image = None;
        for token in tokens.by_ref() {
            if token.starts_with("--") {
                continue;
            }
            image = Some(token);
            break;
        }
        let Some(image) = image else { continue };

        let references_stage = stages.contains(&image.to_lowercase());

        if let (Some(keyword), Some(stage)) = (tokens.next(), tokens.next()) {
            if keyword.eq_ignore_ascii_case("AS") {
                stages.push(stage.to_lowercase());
            }
        }

        if !references_stage {
            parents.push(ImageRef::parse(image));
        }
    }

    parents
}

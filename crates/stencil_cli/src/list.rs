//! `stencil list`: enumerate template names.

use regex::Regex;
use stencil_source::Container;

use crate::host::with_host;
use crate::{GlobalArgs, ListArgs, EXIT_OK};

/// Runs the `stencil list` command.
///
/// Prints one name per line in backend precedence order.
pub fn run(args: &ListArgs, global: &GlobalArgs) -> Result<i32, Box<dyn std::error::Error>> {
    let pattern = args.pattern.as_deref().map(Regex::new).transpose()?;
    with_host(global, |host| {
        let names = matching(host.backend().names()?, pattern.as_ref());
        for name in &names {
            println!("{name}");
        }
        if !global.quiet && names.is_empty() {
            eprintln!("no templates found");
        }
        Ok(EXIT_OK)
    })
}

fn matching(names: Vec<String>, pattern: Option<&Regex>) -> Vec<String> {
    match pattern {
        Some(re) => names.into_iter().filter(|n| re.is_match(n)).collect(),
        None => names,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_filters_anywhere_in_name() {
        let names = vec!["blog/post".to_string(), "index".to_string(), "blog".to_string()];
        let re = Regex::new("^blog").unwrap();
        assert_eq!(matching(names.clone(), Some(&re)), ["blog/post", "blog"]);
        assert_eq!(matching(names, None).len(), 3);
    }
}

use std::env;
use std::fs;
use std::path::Path;

use itertools::Itertools;

// Walks the module tree and emits one `ErrorKind` variant per module,
// included by `src/dagon/error/mod.rs`.

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();

    let mut variants = vec![String::from("Error")];
    visit(Path::new("src/dagon"), &mut Vec::new(), &mut variants);
    variants.sort();
    variants.dedup();

    let body = variants
        .iter()
        .map(|v| format!("    {},", v))
        .join("\n");
    let code = format!(
        "/// Kinds of errors, one per module of `dagon`.\n\
         #[derive(Debug, Copy, Clone, Eq, PartialEq)]\n\
         pub enum ErrorKind {{\n{}\n}}\n",
        body,
    );

    fs::write(Path::new(&out_dir).join("error_kind.rs"), code).unwrap();
    println!("cargo:rerun-if-changed=src/dagon");
}

fn visit(dir: &Path, stack: &mut Vec<String>, out: &mut Vec<String>) {
    let mut entries: Vec<_> = match fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).collect(),
        Err(_) => return,
    };
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name().into_string().unwrap();
        if path.is_dir() {
            stack.push(name);
            out.push(camel(stack));
            visit(&path, stack, out);
            stack.pop();
        } else if name.ends_with(".rs") && name != "mod.rs" {
            stack.push(name.trim_end_matches(".rs").to_string());
            out.push(camel(stack));
            stack.pop();
        }
    }
}

fn camel(stack: &[String]) -> String {
    stack
        .iter()
        .flat_map(|component| component.split('_'))
        .map(|word| {
            let mut cs = word.chars();
            match cs.next() {
                Some(first) => first.to_uppercase().chain(cs).collect::<String>(),
                None => String::new(),
            }
        })
        .join("")
}

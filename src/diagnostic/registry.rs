/// An entry in the error code registry.
pub struct ErrorEntry {
    pub code: &'static str,
    pub short: &'static str,  // one line, for listings
    pub help: &'static str,   // suggestion attached to diagnostics; may be empty
    pub long: &'static str,   // full explanation for `explain`
}

/// All stable diagnostic codes.
pub static REGISTRY: &[ErrorEntry] = &[
    // ── Parse ────────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "TMPL-P001",
        short: "unexpected end of template",
        help: "close the comment with </tmpl_comment>",
        long: r#"## TMPL-P001: unexpected end of template

The template ended inside a construct that needs an explicit end,
most often a `<tmpl_comment>` with no matching `</tmpl_comment>`.

**Example:**

    <tmpl_comment> draft text

**Fix:**

    <tmpl_comment> draft text </tmpl_comment>
"#,
    },
    ErrorEntry {
        code: "TMPL-P002",
        short: "expected token",
        help: "",
        long: r#"## TMPL-P002: expected token

A specific token was required at this point, such as the `>` that
closes a tag or the `)` that closes an argument list.

**Example:**

    <tmpl_var size(items>

**Fix:**

    <tmpl_var size(items)>
"#,
    },
    ErrorEntry {
        code: "TMPL-P003",
        short: "incorrect operator",
        help: "known tags are var, if, unless, elsif, else, foreach, break, include, call, block, comment, verbose",
        long: r#"## TMPL-P003: incorrect operator

Text starting with `<tmpl_` must continue with a known tag keyword.
Keywords are case-insensitive.

**Example:**

    <tmpl_value name>

**Fix:**

    <tmpl_var name>
"#,
    },
    ErrorEntry {
        code: "TMPL-P004",
        short: "missing whitespace",
        help: "put a space between the tag keyword and its argument",
        long: r#"## TMPL-P004: missing whitespace

Tags that take an argument need at least one whitespace character
between the keyword and the argument.

**Example:**

    <tmpl_var(a + 1)>

**Fix:**

    <tmpl_var (a + 1)>
"#,
    },
    ErrorEntry {
        code: "TMPL-P005",
        short: "invalid expression",
        help: "",
        long: r#"## TMPL-P005: invalid expression

An expression was expected but something else was found: an empty
tag, a dangling unary operator, a trailing comma or a broken
member access.

**Example:**

    <tmpl_var >
    <tmpl_var user.>

Binary operators are only accepted inside parentheses:

    <tmpl_var (a + b)>
"#,
    },
    ErrorEntry {
        code: "TMPL-P006",
        short: "invalid string literal",
        help: "",
        long: r#"## TMPL-P006: invalid string literal

A quoted string is missing its closing quote or contains an escape
sequence that cannot be decoded. Escapes are the C control letters
(`\n`, `\t`, `\r` and friends), octal `\NNN`, hex `\xHH` and
`\uXXXX`; any other escaped character stands for itself.

**Example:**

    <tmpl_var 'unterminated>
"#,
    },
    ErrorEntry {
        code: "TMPL-P007",
        short: "invalid number",
        help: "",
        long: r#"## TMPL-P007: invalid number

A numeric literal could not be read: an exponent without digits or an
integer that does not fit in 64 bits. Only decimal literals are
accepted.

**Example:**

    <tmpl_var (1e + 2)>
    <tmpl_var 99999999999999999999>
"#,
    },
    ErrorEntry {
        code: "TMPL-P008",
        short: "mismatched or unclosed tag",
        help: "",
        long: r#"## TMPL-P008: mismatched or unclosed tag

A container tag (`if`, `unless`, `foreach`, `block`, `verbose`) was
not closed, was closed by the wrong tag, or a closing or branch tag
appeared where no container was open. Unclosed tags are reported at
the opening tag.

**Example:**

    <tmpl_if a>yes</tmpl_foreach>

**Fix:**

    <tmpl_if a>yes</tmpl_if>
"#,
    },
    ErrorEntry {
        code: "TMPL-P009",
        short: "closing tag for a tag without a body",
        help: "",
        long: r#"## TMPL-P009: closing tag for a tag without a body

Tags such as `var`, `break`, `include` and `call` have no body, so a
closing form like `</tmpl_var>` is never valid.
"#,
    },
    ErrorEntry {
        code: "TMPL-P010",
        short: "unknown function",
        help: "check the function name or register it before compiling",
        long: r#"## TMPL-P010: unknown function

A function call names a function that is not in the table the
template is compiled against.

**Example:**

    <tmpl_var shout(name)>

Use a built-in such as `uc(name)`, or register `shout` in the
function table passed to the compiler.
"#,
    },
    ErrorEntry {
        code: "TMPL-P011",
        short: "invalid block name",
        help: "",
        long: r#"## TMPL-P011: invalid block name

A block name must be a quoted string. A call with a quoted name must
refer to a block defined earlier in the template. Argument names must
be identifiers.

**Example:**

    <tmpl_call "footer">        (no such block yet)
    <tmpl_block footer>         (name not quoted)
"#,
    },
    ErrorEntry {
        code: "TMPL-P012",
        short: "wrong number of block arguments",
        help: "",
        long: r#"## TMPL-P012: wrong number of block arguments

A call to a block by literal name passes a different number of
arguments than the block declares.

**Example:**

    <tmpl_block "row" args(a, b)>...</tmpl_block>
    <tmpl_call "row" args(1)>
"#,
    },
    ErrorEntry {
        code: "TMPL-P013",
        short: "duplicate definition",
        help: "",
        long: r#"## TMPL-P013: duplicate definition

A block with this name already exists, or a block lists the same
argument name twice.
"#,
    },
    ErrorEntry {
        code: "TMPL-P014",
        short: "forbidden nesting",
        help: "define blocks at the top level of a template",
        long: r#"## TMPL-P014: forbidden nesting

Blocks cannot be defined inside another block or inside a
`foreach` body.
"#,
    },
    ErrorEntry {
        code: "TMPL-P015",
        short: "break outside loop",
        help: "",
        long: r#"## TMPL-P015: break outside loop

`<tmpl_break>` must appear inside a `foreach` body of the same
template file. A break in an included file does not exit a loop of
the including file.
"#,
    },
    ErrorEntry {
        code: "TMPL-P016",
        short: "include failed",
        help: "",
        long: r#"## TMPL-P016: include failed

An included template could not be loaded, failed to compile, or the
include chain exceeded the maximum depth. Errors inside an included
file are reported with that file's name and position.
"#,
    },
    ErrorEntry {
        code: "TMPL-P018",
        short: "invalid foreach header",
        help: "write <tmpl_foreach list as item>",
        long: r#"## TMPL-P018: invalid foreach header

A `foreach` tag takes a variable, the keyword `as`, and an iterator
name.

**Example:**

    <tmpl_foreach items item>

**Fix:**

    <tmpl_foreach items as item>
"#,
    },
    // ── Warnings ─────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "TMPL-W001",
        short: "constant condition",
        help: "",
        long: r#"## TMPL-W001: constant condition

The condition of an `if` or `unless` is a literal, so the branch is
always or never taken. The compiler drops the test.

**Example:**

    <tmpl_if 0>never shown</tmpl_if>
"#,
    },
    // ── Runtime ──────────────────────────────────────────────────────────────
    ErrorEntry {
        code: "TMPL-R001",
        short: "stack fault",
        help: "",
        long: r#"## TMPL-R001: stack fault

The value stack underflowed, overflowed its limit, or was not empty
when the program halted. Deep recursion through blocks is the usual
cause of overflow; the others indicate a damaged program.
"#,
    },
    ErrorEntry {
        code: "TMPL-R002",
        short: "type error",
        help: "",
        long: r#"## TMPL-R002: type error

A value was used in a way its type does not support: indexing a hash
with a number, an array with a string, or looping over a scalar.
Indexing or looping over an undefined value is not an error.
"#,
    },
    ErrorEntry {
        code: "TMPL-R003",
        short: "arithmetic error",
        help: "",
        long: r#"## TMPL-R003: arithmetic error

Division by zero, integer overflow, or arithmetic on an array or hash.
"#,
    },
    ErrorEntry {
        code: "TMPL-R004",
        short: "invalid program",
        help: "",
        long: r#"## TMPL-R004: invalid program

The VM met an unknown opcode, a bad operand, a jump out of range or an
unbalanced block return. Programs from the compiler never do this; a
hand-edited or corrupted compiled file can.
"#,
    },
    ErrorEntry {
        code: "TMPL-R005",
        short: "bad block call",
        help: "",
        long: r#"## TMPL-R005: bad block call

A call by computed name found no block with that name, the name was
not a string, or the argument count did not match.
"#,
    },
    ErrorEntry {
        code: "TMPL-R006",
        short: "function failed",
        help: "",
        long: r#"## TMPL-R006: function failed

A function called from the template reported an error, or the
program uses a function the runtime table does not provide.
"#,
    },
    ErrorEntry {
        code: "TMPL-R007",
        short: "limit exceeded",
        help: "raise --max-steps if the template is expected to be this expensive",
        long: r#"## TMPL-R007: limit exceeded

The render ran more instructions than the step limit allows, or
block calls nested deeper than the call depth limit.
"#,
    },
    // ── Compiled files ───────────────────────────────────────────────────────
    ErrorEntry {
        code: "TMPL-D001",
        short: "not a compiled template",
        help: "recompile the template with this version",
        long: r#"## TMPL-D001: not a compiled template

The file does not start with the compiled-template header, or it was
written by an incompatible format version.
"#,
    },
    ErrorEntry {
        code: "TMPL-D002",
        short: "truncated compiled template",
        help: "",
        long: r#"## TMPL-D002: truncated compiled template

The compiled file ended early or holds text that is not UTF-8.
"#,
    },
    ErrorEntry {
        code: "TMPL-D003",
        short: "invalid compiled template",
        help: "",
        long: r#"## TMPL-D003: invalid compiled template

The compiled file decoded but references literals, blocks, functions
or jump targets that do not exist.
"#,
    },
];

/// Look up an error entry by code (e.g. `"TMPL-P005"`).
pub fn lookup(code: &str) -> Option<&'static ErrorEntry> {
    REGISTRY.iter().find(|e| e.code == code)
}

/// The suggestion for `code`, if it has one.
pub fn hint(code: &str) -> Option<&'static str> {
    lookup(code).map(|e| e.help).filter(|h| !h.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_code() {
        let e = lookup("TMPL-P005").expect("TMPL-P005 should be in registry");
        assert_eq!(e.code, "TMPL-P005");
        assert!(!e.short.is_empty());
        assert!(e.long.contains("TMPL-P005"));
    }

    #[test]
    fn lookup_unknown_returns_none() {
        assert!(lookup("TMPL-X999").is_none());
        assert!(lookup("").is_none());
    }

    #[test]
    fn hints() {
        assert!(hint("TMPL-P004").is_some());
        assert!(hint("TMPL-P005").is_none());
        assert!(hint("nope").is_none());
    }

    #[test]
    fn all_codes_unique() {
        let mut codes: Vec<&str> = REGISTRY.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        let len_before = codes.len();
        codes.dedup();
        assert_eq!(codes.len(), len_before, "duplicate codes in registry");
    }

    #[test]
    fn long_text_names_its_code() {
        for entry in REGISTRY {
            assert!(!entry.short.is_empty(), "{} missing short description", entry.code);
            assert!(entry.long.starts_with(&format!("## {}:", entry.code)), "{} heading", entry.code);
        }
    }
}

//! Built-in engine scripts.
//!
//! [`REQUEST_LOOP`] is the default bootstrap for persistent engines: it loads
//! the version file, prints a `ready` line and then answers newline-delimited
//! JSON requests read from stdin, one reply line per request. Anything user
//! code prints is captured into the reply's `output` field so stdout stays a
//! clean framing channel.
//!
//! The remaining constants are canned query bodies run through the normal
//! `query` op; they assign their answer to `result`.

/// `type` value of the line the engine prints once the project is loaded
pub const READY_TYPE: &str = "ready";

/// `type` value of the line the engine prints when loading failed
pub const FATAL_TYPE: &str = "fatal";

pub const REQUEST_LOOP: &str = r#"
import contextlib
import io
import json
import sys
import traceback


def emit(obj):
    sys.__stdout__.write(json.dumps(obj, default=str) + "\n")
    sys.__stdout__.flush()


def network_stats(visum):
    try:
        net = visum.Net
        return {"nodes": net.Nodes.Count, "links": net.Links.Count, "zones": net.Zones.Count}
    except Exception:
        return None


def open_visum(project):
    import win32com.client

    visum = win32com.client.Dispatch("Visum.Visum")
    visum.LoadVersion(project)
    return visum


def engine_version(visum):
    for name in ("VersionNumber", "Version"):
        try:
            value = getattr(visum, name)
            if value is not None:
                return str(value)
        except Exception:
            pass
    return None


def handle(visum, project, namespace, request):
    op = request.get("op")
    if op == "query":
        scope = dict(namespace)
        scope["result"] = None
        scope["description"] = request.get("description")
        exec(compile(request.get("code") or "", "<query>", "exec"), scope)
        return scope.get("result")
    if op == "ping":
        return {"alive": True, "network": network_stats(visum)}
    if op == "project_info":
        return {"project": project, "version": engine_version(visum), "network": network_stats(visum)}
    if op == "save_project":
        path = request.get("path") or project
        visum.SaveVersion(path)
        return {"path": path}
    if op == "shutdown":
        return {"stopping": True}
    raise ValueError("unknown op: %s" % op)


def main():
    project = sys.argv[1]
    try:
        visum = open_visum(project)
    except Exception as exc:
        emit({"type": "fatal", "error": str(exc), "traceback": traceback.format_exc()})
        return 1

    emit({"type": "ready", "version": engine_version(visum), "network": network_stats(visum)})
    namespace = {"Visum": visum, "visum": visum, "json": json}

    for line in sys.stdin:
        line = line.strip()
        if not line:
            continue
        try:
            request = json.loads(line)
        except ValueError:
            continue

        reply = {"requestId": request.get("requestId")}
        captured = io.StringIO()
        try:
            with contextlib.redirect_stdout(captured):
                reply["result"] = handle(visum, project, namespace, request)
            reply["success"] = True
        except Exception as exc:
            reply["success"] = False
            reply["error"] = str(exc)
            reply["traceback"] = traceback.format_exc()
        reply["output"] = captured.getvalue()
        reply["network"] = network_stats(visum)
        emit(reply)

        if request.get("op") == "shutdown":
            break
    return 0


sys.exit(main())
"#;

/// Reports which attribute names this engine version exposes
pub const CAPABILITY_PROBE: &str = r#"
def _attrs(container):
    try:
        return sorted(a.Code.upper() for a in container.Attributes.GetAll)
    except Exception:
        return []

def _first(candidates, available):
    return next((c for c in candidates if c in available), None)

_tsys = _attrs(Visum.Net.TSystems)
_modes = _attrs(Visum.Net.Modes)
_dsegs = _attrs(Visum.Net.DemandSegments)

result = {
    "tsystemTypeAttribute": _first(("TYPE", "TSYSTYPE"), _tsys),
    "modeTsysAttribute": _first(("TSYSSET",), _modes),
    "demandSegmentModeAttribute": _first(("MODE", "MODECODE"), _dsegs),
    "attributes": {"tsystems": _tsys, "modes": _modes, "demandSegments": _dsegs},
}
"#;

/// Lists every plausible demand segment -> mode -> transport system mapping
///
/// Each candidate names the heuristic that produced it; nothing is ranked.
pub const MODE_MAPPINGS: &str = r#"
def _rows(container, names):
    out = []
    for item in container.GetAll:
        row = {}
        for name in names:
            try:
                row[name] = item.AttValue(name)
            except Exception:
                row[name] = None
        out.append(row)
    return out

def _text(value):
    return "" if value is None else str(value)

_tsys = _rows(Visum.Net.TSystems, ["CODE", "NAME", "TYPE"])
_modes = _rows(Visum.Net.Modes, ["CODE", "NAME", "TSYSSET"])
_dsegs = _rows(Visum.Net.DemandSegments, ["CODE", "NAME", "MODE"])

_candidates = []
for d in _dsegs:
    dcode = _text(d.get("CODE"))
    for m in _modes:
        mcode = _text(m.get("CODE"))
        tsystems = [t for t in _text(m.get("TSYSSET")).split(",") if t]
        entry = {"demandSegment": dcode, "mode": mcode, "tsystems": tsystems}
        if mcode and _text(d.get("MODE")) == mcode:
            _candidates.append(dict(entry, matchedBy="mode_attribute"))
        if mcode and (mcode.upper() == dcode.upper() or _text(m.get("NAME")).upper() == _text(d.get("NAME")).upper()):
            _candidates.append(dict(entry, matchedBy="name_match"))
        if mcode and dcode and mcode[0].upper() == dcode[0].upper():
            _candidates.append(dict(entry, matchedBy="first_letter"))

result = {"tsystems": _tsys, "modes": _modes, "demandSegments": _dsegs, "candidates": _candidates}
"#;
